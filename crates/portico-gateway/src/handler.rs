//! Endpoint-specific message handling
//!
//! The endpoint manager owns connection lifecycle; everything an endpoint
//! does with payloads lives behind [`EndpointHandler`].

use async_trait::async_trait;
use portico_config::HandlerKind;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{trace, warn};

use crate::connection::Connection;
use crate::protocol::ServerNotice;
use crate::registry::Registry;

/// Callbacks invoked by an endpoint manager
///
/// Calls for one endpoint are made sequentially from its manager task, so
/// a slow handler delays every connection on that endpoint.
#[async_trait]
pub trait EndpointHandler: Send + Sync {
    /// Welcome hook, called once the connection is active.
    async fn on_open(&self, _registry: &Registry, _connection: &Arc<Connection>) {}

    /// A data frame arrived on an active connection.
    async fn on_message(&self, registry: &Registry, connection: &Arc<Connection>, message: Message);

    /// The connection has been removed from the registry.
    async fn on_close(&self, _registry: &Registry, _connection: &Arc<Connection>) {}
}

/// Handlers available from configuration
#[derive(Debug, Clone)]
pub struct BuiltinHandler {
    kind: HandlerKind,
    welcome: bool,
}

impl BuiltinHandler {
    pub fn new(kind: HandlerKind, welcome: bool) -> Self {
        Self { kind, welcome }
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }
}

#[async_trait]
impl EndpointHandler for BuiltinHandler {
    async fn on_open(&self, _registry: &Registry, connection: &Arc<Connection>) {
        if !self.welcome {
            return;
        }
        let identity = connection.identity().unwrap_or_else(crate::Identity::anonymous);
        let notice = ServerNotice::Welcome {
            connection_id: connection.id().to_string(),
            endpoint: connection.endpoint().to_string(),
            identity: identity.name,
            anonymous: identity.anonymous,
        };
        if let Err(e) = connection.send_json(&notice) {
            warn!(conn_id = %connection.id(), error = %e, "failed to send welcome");
        }
    }

    async fn on_message(&self, registry: &Registry, connection: &Arc<Connection>, message: Message) {
        match self.kind {
            HandlerKind::Echo => {
                if let Err(e) = connection.send(message) {
                    warn!(conn_id = %connection.id(), error = %e, "echo failed");
                }
            }
            HandlerKind::Relay => {
                let sender = connection.id();
                registry.broadcast(message, |other| other.id() != sender);
            }
            HandlerKind::Discard => {
                trace!(conn_id = %connection.id(), "message discarded");
            }
        }
    }
}
