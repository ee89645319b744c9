//! Caching client for remote lights
//!
//! Handles are cached per controller. A cached handle is checked for
//! liveness before each use; a failed check or a failed call evicts it so
//! the next request resolves afresh. Resolution is retried a bounded number
//! of times with a fixed delay. When no live handle can be had, every
//! operation returns `None` and the caller falls back to the local light.
//!
//! Every operation takes the caller's stop signal: once it is raised no
//! further attempt is made and a pending retry delay ends at once.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::simulation::{AgentId, ControllerId, Position, StopSignal, DEFAULT_REGISTRY_PORT};

use super::endpoint::{LightEndpoint, RemoteError, RemoteLightHandle};
use super::protocol::LightStateDto;

/// How often a retry delay checks whether the client was closed
const CLOSE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Resolution attempts per cache miss
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub io_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_REGISTRY_PORT,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            io_timeout: Duration::from_secs(2),
        }
    }
}

/// Resolves a controller id to a live endpoint
pub trait LightLocator: Send + Sync {
    fn locate(
        &self,
        id: ControllerId,
        host: &str,
        port: u16,
    ) -> Result<Arc<dyn LightEndpoint>, RemoteError>;
}

/// Resolves through a registry over TCP
#[derive(Debug, Clone)]
pub struct TcpLocator {
    pub io_timeout: Duration,
}

impl LightLocator for TcpLocator {
    fn locate(
        &self,
        id: ControllerId,
        host: &str,
        port: u16,
    ) -> Result<Arc<dyn LightEndpoint>, RemoteError> {
        let handle = RemoteLightHandle::lookup(id, host, port, self.io_timeout)?;
        Ok(Arc::new(handle))
    }
}

/// Connection counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStats {
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cached: usize,
}

impl fmt::Display for ClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Light client stats:")?;
        writeln!(f, "  Successful connections: {}", self.successful_connections)?;
        writeln!(f, "  Failed connections: {}", self.failed_connections)?;
        writeln!(f, "  Cache hits: {}", self.cache_hits)?;
        writeln!(f, "  Cache misses: {}", self.cache_misses)?;
        write!(f, "  Cached lights: {}", self.cached)
    }
}

pub struct LightClient {
    config: RwLock<ClientConfig>,
    locator: Box<dyn LightLocator>,
    cache: RwLock<HashMap<ControllerId, Arc<dyn LightEndpoint>>>,
    locations: RwLock<HashMap<ControllerId, (String, u16)>>,
    successful_connections: AtomicU64,
    failed_connections: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    closed: StopSignal,
}

impl fmt::Debug for LightClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LightClient")
            .field("config", &self.config())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl LightClient {
    /// A client resolving over TCP
    pub fn new(config: ClientConfig) -> Self {
        let locator = TcpLocator {
            io_timeout: config.io_timeout,
        };
        Self::with_locator(config, Box::new(locator))
    }

    pub fn with_locator(config: ClientConfig, locator: Box<dyn LightLocator>) -> Self {
        Self {
            config: RwLock::new(config),
            locator,
            cache: RwLock::new(HashMap::new()),
            locations: RwLock::new(HashMap::new()),
            successful_connections: AtomicU64::new(0),
            failed_connections: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            closed: StopSignal::new(),
        }
    }

    pub fn config(&self) -> ClientConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Host and port used for controllers without a registered location
    pub fn configure_defaults(&self, host: &str, port: u16) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        config.host = host.to_string();
        config.port = port;
        info!("Light client defaults set to {}:{}", host, port);
    }

    pub fn register_location(&self, id: ControllerId, host: &str, port: u16) {
        self.locations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (host.to_string(), port));
        debug!("Light {} located at {}:{}", id, host, port);
    }

    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn evict(&self, id: ControllerId) {
        if self
            .cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
        {
            debug!("Evicted light {} from cache", id);
        }
    }

    pub fn is_cached(&self, id: ControllerId) -> bool {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            successful_connections: self.successful_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cached: self.cache.read().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    /// Refuse further resolution and cut pending retry delays short
    pub fn close(&self) {
        self.closed.stop();
        self.clear_cache();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_stopped()
    }

    fn location(&self, id: ControllerId) -> (String, u16) {
        if let Some(location) = self
            .locations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
        {
            return location.clone();
        }
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        (config.host.clone(), config.port)
    }

    /// A live endpoint for `id`, from cache or freshly resolved
    fn endpoint(&self, id: ControllerId, cancel: &StopSignal) -> Option<Arc<dyn LightEndpoint>> {
        if self.is_closed() || cancel.is_stopped() {
            return None;
        }

        let cached = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned();
        if let Some(endpoint) = cached {
            match endpoint.is_alive() {
                Ok(true) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(endpoint);
                }
                Ok(false) => {
                    debug!("Cached light {} is no longer alive", id);
                    self.evict(id);
                }
                Err(e) => {
                    warn!("Liveness check for light {} failed: {}", id, e);
                    self.evict(id);
                }
            }
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let (host, port) = self.location(id);
        match self.connect_with_retry(id, &host, port, cancel) {
            Some(endpoint) => {
                self.cache
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id, Arc::clone(&endpoint));
                self.successful_connections.fetch_add(1, Ordering::Relaxed);
                Some(endpoint)
            }
            None if cancel.is_stopped() => {
                debug!("Resolution of light {} abandoned, caller stopping", id);
                None
            }
            None => {
                self.failed_connections.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn connect_with_retry(
        &self,
        id: ControllerId,
        host: &str,
        port: u16,
        cancel: &StopSignal,
    ) -> Option<Arc<dyn LightEndpoint>> {
        let config = self.config();
        let attempts = config.max_retries.max(1);

        for attempt in 1..=attempts {
            if cancel.is_stopped() {
                return None;
            }
            match self.locator.locate(id, host, port) {
                Ok(endpoint) => {
                    info!(
                        "Connected to remote light {} (attempt {}/{})",
                        id, attempt, attempts
                    );
                    return Some(endpoint);
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        "Failed to connect to light {} (attempt {}/{}): {}, retrying in {:?}",
                        id, attempt, attempts, e, config.retry_delay
                    );
                    if !self.pause(config.retry_delay, cancel) {
                        return None;
                    }
                }
                Err(e) => {
                    error!(
                        "Failed to connect to remote light {} after {} attempts: {}",
                        id, attempts, e
                    );
                }
            }
        }
        None
    }

    /// Sleep between attempts; `false` once the caller stops or the client
    /// is closed
    fn pause(&self, delay: Duration, cancel: &StopSignal) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            if self.is_closed() || cancel.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            // The caller's signal cuts the sleep short; closing is seen
            // within one poll
            if !cancel.sleep((deadline - now).min(CLOSE_POLL)) {
                return false;
            }
        }
    }

    /// Run one remote call; a failure evicts the handle and yields `None`
    fn call<T>(
        &self,
        id: ControllerId,
        operation: &str,
        cancel: &StopSignal,
        op: impl FnOnce(&dyn LightEndpoint) -> Result<T, RemoteError>,
    ) -> Option<T> {
        let endpoint = self.endpoint(id, cancel)?;
        match op(endpoint.as_ref()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Remote {} on light {} failed: {}", operation, id, e);
                self.evict(id);
                None
            }
        }
    }

    pub fn current_state(&self, id: ControllerId, cancel: &StopSignal) -> Option<LightStateDto> {
        self.call(id, "get_state", cancel, |endpoint| endpoint.current_state())
    }

    pub fn request_green(
        &self,
        id: ControllerId,
        vehicle: AgentId,
        cancel: &StopSignal,
    ) -> Option<bool> {
        self.call(id, "request_green", cancel, |endpoint| {
            endpoint.request_green(vehicle)
        })
    }

    pub fn request_crossing(
        &self,
        id: ControllerId,
        pedestrian: AgentId,
        cancel: &StopSignal,
    ) -> Option<bool> {
        self.call(id, "request_crossing", cancel, |endpoint| {
            endpoint.request_crossing(pedestrian)
        })
    }

    pub fn finish_crossing(
        &self,
        id: ControllerId,
        pedestrian: AgentId,
        cancel: &StopSignal,
    ) -> Option<()> {
        self.call(id, "finish_crossing", cancel, |endpoint| {
            endpoint.finish_crossing(pedestrian)
        })
    }

    pub fn position(&self, id: ControllerId, cancel: &StopSignal) -> Option<Position> {
        self.call(id, "get_position", cancel, |endpoint| endpoint.position())
    }

    pub fn is_alive(&self, id: ControllerId, cancel: &StopSignal) -> Option<bool> {
        self.call(id, "is_alive", cancel, |endpoint| endpoint.is_alive())
    }
}
