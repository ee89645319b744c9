//! Remote access to traffic light controllers
//!
//! A [`LightRegistry`] exports local lights under stable names; a
//! [`LightClient`] resolves them by controller id, caches live handles and
//! reports an unavailable light as `None` so callers can fall back to the
//! local controller.

mod client;
mod endpoint;
pub mod protocol;
mod registry;
mod server;

pub use client::{ClientConfig, ClientStats, LightClient, LightLocator, TcpLocator};
pub use endpoint::{LightEndpoint, RemoteError, RemoteLightHandle};
pub use protocol::{binding_name, LightStateDto, ProtocolError, Request, Response};
pub use registry::{handle_request, LightRegistry};
pub use server::LightServer;
