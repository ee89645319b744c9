//! Lookup service binding light servers by name
//!
//! A TCP listener on loopback answers one request per connection. Each
//! accepted connection is handled on its own thread; the accept loop polls
//! its stop signal between attempts so `stop` returns promptly.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::simulation::{ControllerId, StopSignal, TrafficLight};

use super::endpoint::{LightEndpoint, RemoteError, RemoteLightHandle};
use super::protocol::{self, binding_name, Request, Response};
use super::server::LightServer;

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

type Bindings = Arc<RwLock<HashMap<String, Arc<LightServer>>>>;

#[derive(Debug)]
pub struct LightRegistry {
    port: u16,
    bindings: Bindings,
    stop: Arc<StopSignal>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LightRegistry {
    /// Bind the lookup service on loopback; port 0 picks a free port
    pub fn start(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .with_context(|| format!("Failed to bind registry on port {}", port))?;
        listener
            .set_nonblocking(true)
            .context("Failed to configure registry listener")?;
        let port = listener.local_addr()?.port();

        let bindings: Bindings = Arc::new(RwLock::new(HashMap::new()));
        let stop = Arc::new(StopSignal::new());

        let accept_thread = {
            let bindings = Arc::clone(&bindings);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("light-registry".to_string())
                .spawn(move || accept_loop(listener, bindings, stop))
                .context("Failed to spawn registry thread")?
        };

        info!("Light registry listening on port {}", port);
        Ok(Self {
            port,
            bindings,
            stop,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_stopped()
    }

    /// Unregister everything and shut the listener down
    pub fn stop(&self) {
        if self.stop.is_stopped() {
            return;
        }
        for id in self.registered_ids() {
            self.unregister(id);
        }
        self.stop.stop();

        let thread = self
            .accept_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("Light registry accept thread panicked");
            }
        }
        info!("Light registry on port {} stopped", self.port);
    }

    /// Bind a light; an id already bound keeps its existing server
    pub fn register(&self, light: &Arc<TrafficLight>) -> Arc<LightServer> {
        let name = binding_name(light.id());
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        let server = bindings
            .entry(name.clone())
            .or_insert_with(|| {
                info!("Registered {}", name);
                Arc::new(LightServer::new(Arc::clone(light)))
            });
        Arc::clone(server)
    }

    /// Returns how many lights are bound afterwards
    pub fn register_all(&self, lights: &[Arc<TrafficLight>]) -> usize {
        for light in lights {
            self.register(light);
        }
        self.registered_count()
    }

    /// Unbind and unexport a light
    pub fn unregister(&self, id: ControllerId) -> bool {
        let name = binding_name(id);
        let removed = self
            .bindings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&name);
        match removed {
            Some(server) => {
                server.unexport();
                info!("Unregistered {}", name);
                true
            }
            None => false,
        }
    }

    pub fn server(&self, id: ControllerId) -> Option<Arc<LightServer>> {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&binding_name(id))
            .cloned()
    }

    pub fn registered_ids(&self) -> Vec<ControllerId> {
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<ControllerId> = bindings.values().map(|s| s.id()).collect();
        ids.sort();
        ids
    }

    pub fn registered_count(&self) -> usize {
        self.bindings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Resolve a light bound in the registry at `host:port`
    pub fn lookup_remote(
        id: ControllerId,
        host: &str,
        port: u16,
        io_timeout: Duration,
    ) -> Result<RemoteLightHandle, RemoteError> {
        RemoteLightHandle::lookup(id, host, port, io_timeout)
    }
}

impl Drop for LightRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, bindings: Bindings, stop: Arc<StopSignal>) {
    while !stop.is_stopped() {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Registry connection from {}", peer);
                let bindings = Arc::clone(&bindings);
                let spawned = thread::Builder::new()
                    .name("registry-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = handle_connection(stream, &bindings) {
                            debug!("Registry connection error: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to spawn registry connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                stop.sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!("Registry accept error: {}", e);
                stop.sleep(ACCEPT_POLL);
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, bindings: &Bindings) -> Result<(), protocol::ProtocolError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CONNECTION_TIMEOUT))?;
    stream.set_write_timeout(Some(CONNECTION_TIMEOUT))?;

    let request: Request = protocol::receive(&mut stream)?;
    let response = handle_request(request, bindings);
    protocol::send(&mut stream, &response)
}

fn bound_names(bindings: &RwLock<HashMap<String, Arc<LightServer>>>) -> Vec<String> {
    let mut names: Vec<String> = bindings
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// Answer one request against the current bindings
pub fn handle_request(request: Request, bindings: &RwLock<HashMap<String, Arc<LightServer>>>) -> Response {
    let Some(name) = request.binding() else {
        return Response::Names {
            names: bound_names(bindings),
        };
    };
    let server = bindings
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned();
    let Some(server) = server else {
        return Response::NotBound {
            name: name.to_string(),
        };
    };

    let result = match request {
        Request::Lookup { .. } => Ok(Response::Bound {
            controller_id: server.id(),
        }),
        Request::GetState { .. } => server
            .current_state()
            .map(|state| Response::State { state }),
        Request::RequestGreen { vehicle_id, .. } => server
            .request_green(vehicle_id)
            .map(|granted| Response::Granted { granted }),
        Request::RequestCrossing { pedestrian_id, .. } => server
            .request_crossing(pedestrian_id)
            .map(|granted| Response::Granted { granted }),
        Request::FinishCrossing { pedestrian_id, .. } => server
            .finish_crossing(pedestrian_id)
            .map(|()| Response::Done),
        Request::GetPosition { .. } => server
            .position()
            .map(|position| Response::Position { position }),
        Request::IsAlive { .. } => server.is_alive().map(|alive| Response::Alive { alive }),
        Request::List => Ok(Response::Names {
            names: bound_names(bindings),
        }),
    };
    result.unwrap_or_else(|e| Response::Error {
        message: e.to_string(),
    })
}
