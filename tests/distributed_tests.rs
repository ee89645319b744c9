//! Remote light proxy: wire format, registry, client cache and fallback

mod common;

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use traffic_threads::distributed::protocol::{
    decode, encode, read_message, write_message, MAX_MESSAGE_SIZE,
};
use traffic_threads::distributed::{
    binding_name, handle_request, ClientConfig, LightClient, LightEndpoint, LightLocator,
    LightRegistry, LightServer, LightStateDto, ProtocolError, RemoteError, Request, Response,
};
use traffic_threads::simulation::{
    ActorState, AgentHandle, AgentId, AgentStatus, Car, ControllerId, LightPhase, MotionTimings,
    NodeId, Pedestrian, PedestrianState, Position, SimContext, StopSignal, TrafficLight,
};

/// Caller stop signal for calls that are never cancelled
static NEVER_STOPPED: StopSignal = StopSignal::new();

fn light(id: usize) -> Arc<TrafficLight> {
    Arc::new(TrafficLight::new(
        ControllerId(id),
        Position::new(id as i32 * 2, 0),
        common::manual_timings(),
    ))
}

fn client_for(port: u16) -> LightClient {
    LightClient::new(ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        max_retries: 2,
        retry_delay: Duration::from_millis(10),
        io_timeout: Duration::from_secs(2),
    })
}

/// A port nothing listens on
fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn test_binding_name() {
    assert_eq!(binding_name(ControllerId(0)), "TrafficLight_0");
    assert_eq!(binding_name(ControllerId(12)), "TrafficLight_12");
}

#[test]
fn test_request_round_trip() {
    let request = Request::RequestGreen {
        name: binding_name(ControllerId(3)),
        vehicle_id: AgentId(7),
    };
    let encoded = encode(&request).unwrap();
    let decoded: Request = decode(&encoded).unwrap();
    assert_eq!(request, decoded);
}

#[test]
fn test_state_response_serialization() {
    let response = Response::State {
        state: LightStateDto {
            phase: LightPhase::Yellow,
            controller_id: ControllerId(2),
            timestamp_ms: 1_700_000_000_000,
        },
    };
    let json = String::from_utf8(encode(&response).unwrap()).unwrap();
    assert!(json.starts_with('{'), "should be JSON object: {}", json);
    assert!(json.contains("\"type\":\"State\""));
    let decoded: Response = decode(json.as_bytes()).unwrap();
    assert_eq!(response, decoded);
}

#[test]
fn test_write_message_adds_length_prefix() {
    let data = b"test data";
    let mut buffer = Vec::new();
    write_message(&mut buffer, data).unwrap();

    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    assert_eq!(len, data.len());
    assert_eq!(&buffer[4..], data);

    let mut reader = buffer.as_slice();
    assert_eq!(read_message(&mut reader).unwrap(), data);
}

#[test]
fn test_read_message_errors() {
    let mut empty: &[u8] = &[];
    assert!(matches!(
        read_message(&mut empty),
        Err(ProtocolError::ConnectionClosed)
    ));

    let oversized = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
    let mut reader: &[u8] = &oversized;
    assert!(matches!(
        read_message(&mut reader),
        Err(ProtocolError::MessageTooLarge(_))
    ));
}

#[test]
fn test_server_grants_green_only_on_green() {
    let light = light(0);
    let server = LightServer::new(Arc::clone(&light));

    assert!(!server.request_green(AgentId(1)).unwrap());
    assert_eq!(server.waiting_vehicles(), 1);

    light.advance_phase();
    assert!(server.request_green(AgentId(1)).unwrap());
    assert_eq!(server.waiting_vehicles(), 0);

    let state = server.current_state().unwrap();
    assert_eq!(state.phase, LightPhase::Green);
    assert_eq!(state.controller_id, ControllerId(0));
}

#[test]
fn test_server_crossing_pool() {
    let light = light(0);
    let server = LightServer::new(Arc::clone(&light));

    for pedestrian in 0..3 {
        assert!(server.request_crossing(AgentId(pedestrian)).unwrap());
    }
    assert!(!server.request_crossing(AgentId(3)).unwrap());
    assert_eq!(server.crossings_in_progress(), 3);

    server.finish_crossing(AgentId(0)).unwrap();
    assert!(server.request_crossing(AgentId(3)).unwrap());

    light.advance_phase();
    server.finish_crossing(AgentId(1)).unwrap();
    assert!(!server.request_crossing(AgentId(4)).unwrap(), "only on red");
}

#[test]
fn test_unexported_server_refuses_calls() {
    let light = light(0);
    let server = LightServer::new(light);
    assert!(server.is_alive().unwrap());

    server.unexport();
    assert!(!server.is_alive().unwrap());
    assert!(matches!(
        server.current_state(),
        Err(RemoteError::Unexported)
    ));
}

#[test]
fn test_handle_request_dispatch() {
    let bindings = RwLock::new(HashMap::new());
    let light = light(4);
    bindings.write().unwrap().insert(
        binding_name(ControllerId(4)),
        Arc::new(LightServer::new(Arc::clone(&light))),
    );

    assert_eq!(
        handle_request(Request::List, &bindings),
        Response::Names {
            names: vec!["TrafficLight_4".to_string()]
        }
    );
    assert_eq!(
        handle_request(
            Request::Lookup {
                name: "TrafficLight_4".to_string()
            },
            &bindings
        ),
        Response::Bound {
            controller_id: ControllerId(4)
        }
    );
    assert_eq!(
        handle_request(
            Request::GetPosition {
                name: "TrafficLight_4".to_string()
            },
            &bindings
        ),
        Response::Position {
            position: light.position()
        }
    );
    assert_eq!(
        handle_request(
            Request::IsAlive {
                name: "TrafficLight_9".to_string()
            },
            &bindings
        ),
        Response::NotBound {
            name: "TrafficLight_9".to_string()
        }
    );
}

#[test]
fn test_registry_round_trip() {
    let light = light(1);
    let registry = LightRegistry::start(0).unwrap();
    assert!(registry.is_running());
    registry.register(&light);

    let client = client_for(registry.port());
    let state = client.current_state(ControllerId(1), &NEVER_STOPPED).unwrap();
    assert_eq!(state.phase, LightPhase::Red);
    assert_eq!(state.controller_id, ControllerId(1));
    assert_eq!(client.position(ControllerId(1), &NEVER_STOPPED), Some(light.position()));
    assert_eq!(client.is_alive(ControllerId(1), &NEVER_STOPPED), Some(true));

    assert_eq!(client.request_green(ControllerId(1), AgentId(5), &NEVER_STOPPED), Some(false));
    assert_eq!(
        client.request_crossing(ControllerId(1), AgentId(6), &NEVER_STOPPED),
        Some(true)
    );
    assert_eq!(client.finish_crossing(ControllerId(1), AgentId(6), &NEVER_STOPPED), Some(()));

    light.advance_phase();
    assert_eq!(client.request_green(ControllerId(1), AgentId(5), &NEVER_STOPPED), Some(true));

    let stats = client.stats();
    assert_eq!(stats.successful_connections, 1);
    assert_eq!(stats.failed_connections, 0);
    assert!(stats.cache_hits >= 6);
    assert_eq!(stats.cached, 1);

    registry.stop();
    assert!(!registry.is_running());
}

#[test]
fn test_registry_register_is_idempotent() {
    let registry = LightRegistry::start(0).unwrap();
    let lights = vec![light(0), light(1), light(2)];
    assert_eq!(registry.register_all(&lights), 3);

    let first = registry.register(&lights[0]);
    let again = registry.register(&lights[0]);
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(registry.registered_count(), 3);
    assert_eq!(
        registry.registered_ids(),
        vec![ControllerId(0), ControllerId(1), ControllerId(2)]
    );

    assert!(registry.unregister(ControllerId(1)));
    assert!(!registry.unregister(ControllerId(1)));
    assert!(registry.server(ControllerId(1)).is_none());
    assert!(first.is_alive().unwrap());

    registry.stop();
    assert_eq!(registry.registered_count(), 0);
    assert!(!first.is_exported());
}

#[test]
fn test_lookup_remote() {
    let registry = LightRegistry::start(0).unwrap();
    registry.register(&light(3));

    let handle =
        LightRegistry::lookup_remote(ControllerId(3), "127.0.0.1", registry.port(), Duration::from_secs(1))
            .unwrap();
    assert_eq!(handle.name(), "TrafficLight_3");
    assert!(handle.is_alive().unwrap());

    assert!(matches!(
        LightRegistry::lookup_remote(ControllerId(8), "127.0.0.1", registry.port(), Duration::from_secs(1)),
        Err(RemoteError::NotBound(_))
    ));
}

#[test]
fn test_unregistered_light_becomes_unavailable() {
    let registry = LightRegistry::start(0).unwrap();
    registry.register(&light(2));
    let client = client_for(registry.port());

    assert!(client.current_state(ControllerId(2), &NEVER_STOPPED).is_some());
    assert!(client.is_cached(ControllerId(2)));

    registry.unregister(ControllerId(2));
    assert_eq!(client.current_state(ControllerId(2), &NEVER_STOPPED), None);
    assert!(!client.is_cached(ControllerId(2)));
    assert_eq!(client.stats().failed_connections, 1);
}

#[test]
fn test_unreachable_registry_returns_sentinel() {
    let client = client_for(unused_port());
    assert_eq!(client.current_state(ControllerId(0), &NEVER_STOPPED), None);
    assert_eq!(client.request_green(ControllerId(0), AgentId(1), &NEVER_STOPPED), None);
    assert_eq!(client.finish_crossing(ControllerId(0), AgentId(1), &NEVER_STOPPED), None);

    let stats = client.stats();
    assert_eq!(stats.successful_connections, 0);
    assert_eq!(stats.failed_connections, 3);
    assert_eq!(stats.cache_misses, 3);
    assert_eq!(stats.cached, 0);
}

#[test]
fn test_registered_location_overrides_defaults() {
    let registry = LightRegistry::start(0).unwrap();
    registry.register(&light(5));

    let client = client_for(unused_port());
    client.register_location(ControllerId(5), "127.0.0.1", registry.port());
    assert!(client.current_state(ControllerId(5), &NEVER_STOPPED).is_some());
    assert_eq!(client.current_state(ControllerId(6), &NEVER_STOPPED), None);
}

/// In-memory endpoint whose calls can be made to fail
struct FakeEndpoint {
    fail_next_call: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl FakeEndpoint {
    fn check(&self) -> Result<(), RemoteError> {
        if self.fail_next_call.swap(false, Ordering::SeqCst) {
            return Err(RemoteError::Server("connection reset".to_string()));
        }
        Ok(())
    }
}

impl LightEndpoint for FakeEndpoint {
    fn current_state(&self) -> Result<LightStateDto, RemoteError> {
        self.check()?;
        Ok(LightStateDto {
            phase: LightPhase::Green,
            controller_id: ControllerId(0),
            timestamp_ms: 0,
        })
    }

    fn request_green(&self, _vehicle: AgentId) -> Result<bool, RemoteError> {
        self.check()?;
        Ok(true)
    }

    fn request_crossing(&self, _pedestrian: AgentId) -> Result<bool, RemoteError> {
        self.check()?;
        Ok(false)
    }

    fn finish_crossing(&self, _pedestrian: AgentId) -> Result<(), RemoteError> {
        self.check()
    }

    fn position(&self) -> Result<Position, RemoteError> {
        self.check()?;
        Ok(Position::new(0, 0))
    }

    fn is_alive(&self) -> Result<bool, RemoteError> {
        Ok(self.alive.load(Ordering::SeqCst))
    }
}

#[derive(Clone, Default)]
struct FakeLocator {
    lookups: Arc<AtomicUsize>,
    fail_next_call: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    unreachable: Arc<AtomicBool>,
}

impl LightLocator for FakeLocator {
    fn locate(
        &self,
        _id: ControllerId,
        _host: &str,
        _port: u16,
    ) -> Result<Arc<dyn LightEndpoint>, RemoteError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::NotBound("TrafficLight_0".to_string()));
        }
        Ok(Arc::new(FakeEndpoint {
            fail_next_call: Arc::clone(&self.fail_next_call),
            alive: Arc::clone(&self.alive),
        }))
    }
}

fn fake_client(max_retries: u32) -> (LightClient, FakeLocator) {
    let locator = FakeLocator::default();
    locator.alive.store(true, Ordering::SeqCst);
    let config = ClientConfig {
        max_retries,
        retry_delay: Duration::from_millis(1),
        ..ClientConfig::default()
    };
    let client = LightClient::with_locator(config, Box::new(locator.clone()));
    (client, locator)
}

#[test]
fn test_failed_call_evicts_cached_handle() {
    let (client, locator) = fake_client(3);

    assert!(client.current_state(ControllerId(0), &NEVER_STOPPED).is_some());
    assert!(client.current_state(ControllerId(0), &NEVER_STOPPED).is_some());
    assert_eq!(locator.lookups.load(Ordering::SeqCst), 1);

    locator.fail_next_call.store(true, Ordering::SeqCst);
    assert_eq!(client.current_state(ControllerId(0), &NEVER_STOPPED), None);
    assert!(!client.is_cached(ControllerId(0)));

    // The next call resolves afresh instead of reusing the failed handle
    assert!(client.current_state(ControllerId(0), &NEVER_STOPPED).is_some());
    assert_eq!(locator.lookups.load(Ordering::SeqCst), 2);
}

#[test]
fn test_dead_handle_is_replaced() {
    let (client, locator) = fake_client(3);
    assert_eq!(client.request_green(ControllerId(0), AgentId(1), &NEVER_STOPPED), Some(true));

    locator.alive.store(false, Ordering::SeqCst);
    client.request_green(ControllerId(0), AgentId(1), &NEVER_STOPPED);
    assert_eq!(locator.lookups.load(Ordering::SeqCst), 2);
    assert!(client.stats().cache_misses >= 2);
}

#[test]
fn test_connection_retries_are_bounded() {
    let (client, locator) = fake_client(3);
    locator.unreachable.store(true, Ordering::SeqCst);

    assert_eq!(client.request_crossing(ControllerId(0), AgentId(1), &NEVER_STOPPED), None);
    assert_eq!(locator.lookups.load(Ordering::SeqCst), 3);
    assert_eq!(client.stats().failed_connections, 1);

    locator.unreachable.store(false, Ordering::SeqCst);
    assert_eq!(client.request_crossing(ControllerId(0), AgentId(1), &NEVER_STOPPED), Some(false));
    assert_eq!(locator.lookups.load(Ordering::SeqCst), 4);
}

#[test]
fn test_closed_client_is_unavailable() {
    let (client, locator) = fake_client(3);
    assert!(client.position(ControllerId(0), &NEVER_STOPPED).is_some());

    client.close();
    assert!(client.is_closed());
    assert_eq!(client.position(ControllerId(0), &NEVER_STOPPED), None);
    assert_eq!(locator.lookups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stats_display() {
    let (client, _locator) = fake_client(1);
    client.is_alive(ControllerId(0), &NEVER_STOPPED);
    let text = client.stats().to_string();
    assert!(text.contains("Successful connections: 1"));
    assert!(text.contains("Cache misses: 1"));
    assert!(text.contains("Cached lights: 1"));
}

/// Distributed context whose registry cannot be reached, with default retries
fn unreachable_remote(motion: MotionTimings) -> (Arc<SimContext>, Arc<TrafficLight>) {
    let (ctx, light) = common::line_with_light(7, 2, common::manual_timings(), motion);
    let client = LightClient::new(ClientConfig {
        host: "127.0.0.1".to_string(),
        port: unused_port(),
        ..ClientConfig::default()
    });
    ctx.set_remote(Some(Arc::new(client)));
    (ctx, light)
}

#[test]
fn test_stop_interrupts_car_in_retry_delay() {
    let (ctx, _light) = unreachable_remote(common::fast_motion());
    let car = Car::new(AgentId(1), Arc::clone(&ctx), NodeId(0), NodeId(6));
    let mut handle = AgentHandle::spawn(Box::new(car)).unwrap();

    assert!(common::wait_for(Duration::from_secs(5), || {
        handle.snapshot().position == Some(Position::new(2, 0))
    }));
    // Now inside the first one-second delay between lookups
    std::thread::sleep(Duration::from_millis(50));

    let stopped_at = Instant::now();
    handle.request_stop();
    assert!(handle.join());
    let latency = stopped_at.elapsed();
    assert!(latency < Duration::from_millis(500), "car took {:?} to stop", latency);
    assert_eq!(handle.snapshot().status, AgentStatus::Stopped);
    assert!(ctx.graph().held_by(AgentId(1)).is_empty());

    // An abandoned lookup is not counted as a failed connection
    let stats = ctx.remote().unwrap().stats();
    assert_eq!(stats.failed_connections, 0);
}

#[test]
fn test_stop_interrupts_pedestrian_in_retry_delay() {
    let (ctx, light) = unreachable_remote(common::fast_motion());
    light.advance_phase();
    let pedestrian = Pedestrian::new(AgentId(2), Arc::clone(&ctx), Some(ControllerId(0)));
    let mut handle = AgentHandle::spawn(Box::new(pedestrian)).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let stopped_at = Instant::now();
    handle.request_stop();
    assert!(handle.join());
    let latency = stopped_at.elapsed();
    assert!(
        latency < Duration::from_millis(500),
        "pedestrian took {:?} to stop",
        latency
    );
    assert_eq!(handle.snapshot().status, AgentStatus::Stopped);
    assert_eq!(light.pedestrians_crossing(), 0);
}

#[test]
fn test_pedestrian_falls_back_without_backoff() {
    let motion = MotionTimings {
        pedestrian_backoff: Duration::from_secs(30),
        ..common::fast_motion()
    };
    let (ctx, light) = common::line_with_light(3, 1, common::manual_timings(), motion);
    let client = LightClient::new(ClientConfig {
        host: "127.0.0.1".to_string(),
        port: unused_port(),
        max_retries: 1,
        ..ClientConfig::default()
    });
    ctx.set_remote(Some(Arc::new(client)));

    let pedestrian = Pedestrian::new(AgentId(3), Arc::clone(&ctx), Some(ControllerId(0)));
    let mut handle = AgentHandle::spawn(Box::new(pedestrian)).unwrap();

    // The light is red locally: an unavailable remote goes straight to it
    assert!(common::wait_for(Duration::from_secs(3), || {
        handle.snapshot().state == ActorState::Pedestrian(PedestrianState::Crossing)
    }));
    assert_eq!(light.pedestrians_crossing(), 1);

    handle.request_stop();
    assert!(handle.join());
    assert_eq!(light.pedestrians_crossing(), 0);
}
