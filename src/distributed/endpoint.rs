//! The remote light surface and its TCP stub

use log::debug;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

use crate::simulation::{AgentId, ControllerId, Position};

use super::protocol::{self, binding_name, LightStateDto, ProtocolError, Request, Response};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0} is not bound")]
    NotBound(String),

    #[error("Light is no longer exported")]
    Unexported,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Unexpected response from registry")]
    UnexpectedResponse,
}

/// Operations a light offers across the process boundary
pub trait LightEndpoint: Send + Sync {
    fn current_state(&self) -> Result<LightStateDto, RemoteError>;

    /// Registers the vehicle as waiting; granted only while green
    fn request_green(&self, vehicle: AgentId) -> Result<bool, RemoteError>;

    /// Granted only while red and a permit is free
    fn request_crossing(&self, pedestrian: AgentId) -> Result<bool, RemoteError>;

    fn finish_crossing(&self, pedestrian: AgentId) -> Result<(), RemoteError>;

    fn position(&self) -> Result<Position, RemoteError>;

    fn is_alive(&self) -> Result<bool, RemoteError>;
}

/// Client-side stub for a light bound in a remote registry
///
/// Every call opens a fresh connection, so a handle never holds a socket
/// that could go stale.
#[derive(Debug, Clone)]
pub struct RemoteLightHandle {
    addrs: Vec<SocketAddr>,
    name: String,
    controller: ControllerId,
    io_timeout: Duration,
}

impl RemoteLightHandle {
    /// Resolve a controller in the registry at `host:port`
    pub fn lookup(
        controller: ControllerId,
        host: &str,
        port: u16,
        io_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        let handle = Self {
            addrs,
            name: binding_name(controller),
            controller,
            io_timeout,
        };

        match handle.call(&Request::Lookup {
            name: handle.name.clone(),
        })? {
            Response::Bound { controller_id } if controller_id == controller => {
                debug!("Resolved {} at {}:{}", handle.name, host, port);
                Ok(handle)
            }
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<TcpStream, RemoteError> {
        let mut last_error = None;
        for addr in &self.addrs {
            match TcpStream::connect_timeout(addr, self.io_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.io_timeout))?;
                    stream.set_write_timeout(Some(self.io_timeout))?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(RemoteError::Io(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no address to connect to")
        })))
    }

    fn call(&self, request: &Request) -> Result<Response, RemoteError> {
        let mut stream = self.connect()?;
        protocol::send(&mut stream, request)?;
        match protocol::receive(&mut stream)? {
            Response::NotBound { name } => Err(RemoteError::NotBound(name)),
            Response::Error { message } => Err(RemoteError::Server(message)),
            response => Ok(response),
        }
    }
}

impl LightEndpoint for RemoteLightHandle {
    fn current_state(&self) -> Result<LightStateDto, RemoteError> {
        match self.call(&Request::GetState {
            name: self.name.clone(),
        })? {
            Response::State { state } => Ok(state),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    fn request_green(&self, vehicle: AgentId) -> Result<bool, RemoteError> {
        match self.call(&Request::RequestGreen {
            name: self.name.clone(),
            vehicle_id: vehicle,
        })? {
            Response::Granted { granted } => Ok(granted),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    fn request_crossing(&self, pedestrian: AgentId) -> Result<bool, RemoteError> {
        match self.call(&Request::RequestCrossing {
            name: self.name.clone(),
            pedestrian_id: pedestrian,
        })? {
            Response::Granted { granted } => Ok(granted),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    fn finish_crossing(&self, pedestrian: AgentId) -> Result<(), RemoteError> {
        match self.call(&Request::FinishCrossing {
            name: self.name.clone(),
            pedestrian_id: pedestrian,
        })? {
            Response::Done => Ok(()),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    fn position(&self) -> Result<Position, RemoteError> {
        match self.call(&Request::GetPosition {
            name: self.name.clone(),
        })? {
            Response::Position { position } => Ok(position),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }

    fn is_alive(&self) -> Result<bool, RemoteError> {
        match self.call(&Request::IsAlive {
            name: self.name.clone(),
        })? {
            Response::Alive { alive } => Ok(alive),
            _ => Err(RemoteError::UnexpectedResponse),
        }
    }
}
