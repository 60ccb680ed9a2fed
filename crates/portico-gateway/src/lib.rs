//! Portico Gateway - endpoint-scoped WebSocket connection management
//!
//! Each configured path is served by its own [`EndpointManager`], which owns
//! the connections on that path, authenticates them through an [`AuthGate`]
//! and hands their messages to an [`EndpointHandler`]. The [`DispatchRouter`]
//! maps upgrade requests onto managers and [`serve`] hosts it on a TCP listener.

mod auth;
mod connection;
mod endpoint;
mod error;
mod handler;
mod protocol;
mod registry;
mod router;
mod server;

#[cfg(test)]
mod testing;

pub use auth::{is_truthy, AuthConfig, AuthError, AuthGate, RequestContext};
pub use connection::{
    outbound_channel, Connection, ConnectionState, Identity, Outbound, OutboundReceiver,
    OutboundSender,
};
pub use endpoint::{EndpointManager, EndpointSettings, DEFAULT_EVENT_BUFFER};
pub use error::{GatewayError, Result};
pub use handler::{BuiltinHandler, EndpointHandler};
pub use protocol::ServerNotice;
pub use registry::{BroadcastReport, Registry};
pub use router::{DispatchRouter, UpgradeTicket};
pub use server::{serve, ServerOptions};
