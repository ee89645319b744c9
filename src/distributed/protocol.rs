//! Wire format between light clients and the registry
//!
//! Each message is a 4-byte big-endian length followed by a JSON document.
//! A connection carries exactly one request and its response.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::simulation::{AgentId, ControllerId, LightPhase, Position};

/// Frames larger than this are rejected before allocating
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Prefix of every registry binding name
pub const BINDING_PREFIX: &str = "TrafficLight_";

/// Stable name a controller is bound under
pub fn binding_name(id: ControllerId) -> String {
    format!("{}{}", BINDING_PREFIX, id.0)
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// State of a light as seen through the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightStateDto {
    pub phase: LightPhase,
    pub controller_id: ControllerId,
    /// Wall-clock time the state was read, milliseconds since the epoch
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Resolve a binding name
    Lookup { name: String },
    GetState { name: String },
    RequestGreen { name: String, vehicle_id: AgentId },
    RequestCrossing { name: String, pedestrian_id: AgentId },
    FinishCrossing { name: String, pedestrian_id: AgentId },
    GetPosition { name: String },
    IsAlive { name: String },
    /// All bound names
    List,
}

impl Request {
    /// Binding name the request addresses, `None` for registry-wide requests
    pub fn binding(&self) -> Option<&str> {
        match self {
            Request::Lookup { name }
            | Request::GetState { name }
            | Request::RequestGreen { name, .. }
            | Request::RequestCrossing { name, .. }
            | Request::FinishCrossing { name, .. }
            | Request::GetPosition { name }
            | Request::IsAlive { name } => Some(name),
            Request::List => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Bound { controller_id: ControllerId },
    NotBound { name: String },
    State { state: LightStateDto },
    Granted { granted: bool },
    Done,
    Position { position: Position },
    Alive { alive: bool },
    Names { names: Vec<String> },
    Error { message: String },
}

/// Serialize a message to JSON, without the length prefix
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Write one length-prefixed frame
pub fn write_message<W: Write>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(data.len()));
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(data)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame
pub fn read_message<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_bytes = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_bytes) {
        return Err(match e.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(e),
        });
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

/// Encode and send a message
pub fn send<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    let bytes = encode(message)?;
    write_message(writer, &bytes)
}

/// Receive and decode a message
pub fn receive<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T, ProtocolError> {
    let bytes = read_message(reader)?;
    decode(&bytes)
}
