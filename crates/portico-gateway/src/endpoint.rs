//! Endpoint manager
//!
//! Each endpoint runs one manager task that is the only writer of connection
//! state for that endpoint. Socket events arrive as [`EndpointEvent`]s over a
//! single bounded channel, so events from one socket are handled in the order
//! the socket produced them, and a reader that outpaces the handler waits.
//!
//! Lifecycle per connection:
//!
//! ```text
//! pending -> authenticated -> active -> closing -> closed
//!    \______________________________________________/  (rejected)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthConfig, AuthGate, RequestContext};
use crate::connection::{Connection, OutboundSender};
use crate::error::{GatewayError, Result};
use crate::handler::EndpointHandler;
use crate::registry::{BroadcastReport, Registry};

/// Default depth of an endpoint's inbound event queue
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Construction parameters for one endpoint
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub endpoint: String,
    pub auth: AuthConfig,
    pub max_connections: Option<usize>,
    /// Socket events queued for the manager task before senders wait
    pub event_buffer: usize,
}

impl EndpointSettings {
    pub fn new(endpoint: impl Into<String>, auth: AuthConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth,
            max_connections: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn event_buffer(mut self, depth: usize) -> Self {
        self.event_buffer = depth.max(1);
        self
    }
}

/// Messages delivered to an endpoint's manager task
enum EndpointEvent {
    Open {
        context: RequestContext,
        outbound: OutboundSender,
        reply: oneshot::Sender<Result<Arc<Connection>>>,
    },
    Message {
        connection_id: String,
        message: Message,
    },
    Close {
        connection_id: String,
    },
    Error {
        connection_id: String,
        reason: String,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to one endpoint's manager task
#[derive(Clone)]
pub struct EndpointManager {
    endpoint: Arc<str>,
    registry: Registry,
    events: mpsc::Sender<EndpointEvent>,
}

impl std::fmt::Debug for EndpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointManager")
            .field("endpoint", &self.endpoint)
            .field("connections", &self.registry.len())
            .finish()
    }
}

impl EndpointManager {
    /// Start the manager task for an endpoint. Must be called inside a tokio runtime.
    pub fn spawn(settings: EndpointSettings, handler: Arc<dyn EndpointHandler>) -> Self {
        let endpoint: Arc<str> = settings.endpoint.into();
        let (events_tx, events_rx) = mpsc::channel(settings.event_buffer);
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let registry = Registry::with_evictions(Arc::clone(&endpoint), evict_tx);

        let actor = EndpointActor {
            endpoint: Arc::clone(&endpoint),
            gate: AuthGate::new(settings.auth),
            registry: registry.clone(),
            handler,
            max_connections: settings.max_connections,
            events: events_rx,
            evictions: evict_rx,
        };
        tokio::spawn(actor.run());

        Self {
            endpoint,
            registry,
            events: events_tx,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Socket opened: authenticate and register it.
    ///
    /// On error the connection never became active and the caller must
    /// terminate the socket.
    pub async fn open(
        &self,
        context: RequestContext,
        outbound: OutboundSender,
    ) -> Result<Arc<Connection>> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(EndpointEvent::Open {
                context,
                outbound,
                reply,
            })
            .await
            .map_err(|_| GatewayError::ShuttingDown)?;
        response.await.map_err(|_| GatewayError::ShuttingDown)?
    }

    /// Data frame received on a socket. Waits while the event queue is full.
    pub async fn message(&self, connection_id: &str, message: Message) {
        self.post(EndpointEvent::Message {
            connection_id: connection_id.to_string(),
            message,
        })
        .await;
    }

    /// Socket closed by the peer or the transport.
    pub async fn close(&self, connection_id: &str) {
        self.post(EndpointEvent::Close {
            connection_id: connection_id.to_string(),
        })
        .await;
    }

    /// Socket failed.
    pub async fn error(&self, connection_id: &str, reason: impl Into<String>) {
        self.post(EndpointEvent::Error {
            connection_id: connection_id.to_string(),
            reason: reason.into(),
        })
        .await;
    }

    /// Send to every active connection on this endpoint.
    pub fn broadcast(&self, message: Message) -> BroadcastReport {
        self.registry.broadcast_all(message)
    }

    /// Close every live connection and stop the manager task.
    ///
    /// Waits up to `grace` for sockets to acknowledge, then tears down the
    /// rest. Returns the number of connections closed; calling it again
    /// returns 0.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let (reply, response) = oneshot::channel();
        if self
            .events
            .send(EndpointEvent::Shutdown { grace, reply })
            .await
            .is_err()
        {
            return 0;
        }
        response.await.unwrap_or(0)
    }

    async fn post(&self, event: EndpointEvent) {
        if self.events.send(event).await.is_err() {
            debug!(endpoint = %self.endpoint, "endpoint stopped; event dropped");
        }
    }
}

struct EndpointActor {
    endpoint: Arc<str>,
    gate: AuthGate,
    registry: Registry,
    handler: Arc<dyn EndpointHandler>,
    max_connections: Option<usize>,
    events: mpsc::Receiver<EndpointEvent>,
    evictions: mpsc::UnboundedReceiver<String>,
}

impl EndpointActor {
    async fn run(mut self) {
        debug!(endpoint = %self.endpoint, "endpoint manager started");
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(EndpointEvent::Shutdown { grace, reply }) => {
                        let closed = self.drain(grace).await;
                        let _ = reply.send(closed);
                        break;
                    }
                    Some(event) => self.handle(event).await,
                    None => break,
                },
                Some(connection_id) = self.evictions.recv() => {
                    self.teardown(&connection_id, Some("send failure")).await;
                }
            }
        }
        debug!(endpoint = %self.endpoint, "endpoint manager stopped");
    }

    async fn handle(&mut self, event: EndpointEvent) {
        match event {
            EndpointEvent::Open {
                context,
                outbound,
                reply,
            } => {
                let result = self.open(context, outbound).await;
                let _ = reply.send(result);
            }
            EndpointEvent::Message {
                connection_id,
                message,
            } => self.message(&connection_id, message).await,
            EndpointEvent::Close { connection_id } => self.teardown(&connection_id, None).await,
            EndpointEvent::Error {
                connection_id,
                reason,
            } => self.teardown(&connection_id, Some(&reason)).await,
            EndpointEvent::Shutdown { reply, .. } => {
                let _ = reply.send(0);
            }
        }
    }

    async fn open(
        &mut self,
        context: RequestContext,
        outbound: OutboundSender,
    ) -> Result<Arc<Connection>> {
        let connection = Arc::new(
            Connection::new(Uuid::new_v4().to_string(), &*self.endpoint, outbound)
                .with_peer(context.peer),
        );

        let identity = match self.gate.authenticate(&context) {
            Ok(identity) => identity,
            Err(e) => {
                connection.mark_closed();
                warn!(endpoint = %self.endpoint, peer = ?context.peer, error = %e, "authentication rejected");
                return Err(e.into());
            }
        };
        connection.authenticate(identity)?;

        if let Some(max) = self.max_connections {
            if self.registry.len() >= max {
                connection.mark_closed();
                warn!(endpoint = %self.endpoint, max, "connection limit reached");
                return Err(GatewayError::CapacityExceeded(self.endpoint.to_string()));
            }
        }

        self.registry.add(Arc::clone(&connection))?;
        connection.activate()?;
        info!(
            endpoint = %self.endpoint,
            conn_id = %connection.id(),
            identity = ?connection.identity().map(|i| i.name),
            "connection active"
        );

        self.handler.on_open(&self.registry, &connection).await;
        Ok(connection)
    }

    async fn message(&mut self, connection_id: &str, message: Message) {
        let Some(connection) = self.registry.get(connection_id) else {
            warn!(endpoint = %self.endpoint, conn_id = %connection_id, "protocol violation: message for unknown or closed connection");
            return;
        };
        if !connection.is_active() {
            let violation = GatewayError::ProtocolViolation {
                connection_id: connection_id.to_string(),
                state: connection.state(),
            };
            warn!(endpoint = %self.endpoint, error = %violation, "message dropped");
            return;
        }
        self.handler
            .on_message(&self.registry, &connection, message)
            .await;
    }

    /// Remove a connection exactly once; repeated close-like events are no-ops.
    async fn teardown(&mut self, connection_id: &str, reason: Option<&str>) {
        let Some(connection) = self.registry.remove(connection_id) else {
            debug!(endpoint = %self.endpoint, conn_id = %connection_id, "duplicate close ignored");
            return;
        };
        connection.begin_close();
        connection.close_socket(None);
        connection.mark_closed();
        let duration_ms = connection.connected_for().num_milliseconds();
        match reason {
            Some(reason) => {
                info!(endpoint = %self.endpoint, conn_id = %connection_id, duration_ms, reason, "connection closed with error")
            }
            None => info!(endpoint = %self.endpoint, conn_id = %connection_id, duration_ms, "connection closed"),
        }
        self.handler.on_close(&self.registry, &connection).await;
    }

    async fn drain(&mut self, grace: Duration) -> usize {
        let live = self.registry.all();
        info!(endpoint = %self.endpoint, connections = live.len(), "shutting down endpoint");

        for connection in &live {
            if connection.begin_close() {
                connection.close_socket(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                }));
            }
        }

        let deadline = Instant::now() + grace;
        while !self.registry.is_empty() {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(EndpointEvent::Close { connection_id }))
                | Ok(Some(EndpointEvent::Error { connection_id, .. })) => {
                    self.teardown(&connection_id, None).await;
                }
                Ok(Some(EndpointEvent::Open { reply, .. })) => {
                    let _ = reply.send(Err(GatewayError::ShuttingDown));
                }
                Ok(Some(EndpointEvent::Message { connection_id, .. })) => {
                    debug!(endpoint = %self.endpoint, conn_id = %connection_id, "message dropped during shutdown");
                }
                Ok(Some(EndpointEvent::Shutdown { reply, .. })) => {
                    let _ = reply.send(0);
                }
                Ok(None) | Err(_) => break,
            }
        }

        let remaining = self.registry.all();
        if !remaining.is_empty() {
            warn!(endpoint = %self.endpoint, remaining = remaining.len(), "grace period elapsed; forcing close");
        }
        for connection in remaining {
            self.teardown(connection.id(), Some("shutdown")).await;
        }

        live.len()
    }
}
