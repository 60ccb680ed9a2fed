//! WebSocket connection state
//!
//! A [`Connection`] is the manager-side view of one upgraded socket. The
//! socket itself is owned by the adapter's writer task; the connection only
//! holds the channel feeding that task.
//!
//! Data frames go through a bounded queue. A close request travels beside
//! it on a [`CancellationToken`], so it reaches the writer even when the
//! queue is full.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};

/// Frames queued for the socket writer task
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A data frame
    Frame(Message),
    /// Send a close frame and release the socket
    Close(Option<CloseFrame<'static>>),
}

#[derive(Debug, Default)]
struct CloseSignal {
    requested: CancellationToken,
    frame: Mutex<Option<CloseFrame<'static>>>,
}

/// Create the channel feeding one socket writer task.
///
/// `buffer` bounds the data frames only; a close request never waits for
/// capacity.
pub fn outbound_channel(buffer: usize) -> (OutboundSender, OutboundReceiver) {
    let (frames_tx, frames_rx) = mpsc::channel(buffer);
    let close = Arc::new(CloseSignal::default());
    (
        OutboundSender {
            frames: frames_tx,
            close: Arc::clone(&close),
        },
        OutboundReceiver {
            frames: frames_rx,
            close,
            finished: false,
        },
    )
}

/// Sending half of a socket writer's channel
#[derive(Debug, Clone)]
pub struct OutboundSender {
    frames: mpsc::Sender<Message>,
    close: Arc<CloseSignal>,
}

impl OutboundSender {
    pub fn try_send(&self, message: Message) -> std::result::Result<(), TrySendError<Message>> {
        self.frames.try_send(message)
    }

    /// Ask the writer to close the socket. The first request's frame is the
    /// one sent; later requests are no-ops.
    pub fn close(&self, frame: Option<CloseFrame<'static>>) {
        let mut slot = self.close.frame.lock();
        if self.close.requested.is_cancelled() {
            return;
        }
        *slot = frame;
        self.close.requested.cancel();
    }

    pub fn is_close_requested(&self) -> bool {
        self.close.requested.is_cancelled()
    }

    /// Resolves once a close has been requested.
    pub async fn close_requested(&self) {
        self.close.requested.cancelled().await
    }
}

/// Receiving half, owned by the socket writer task
#[derive(Debug)]
pub struct OutboundReceiver {
    frames: mpsc::Receiver<Message>,
    close: Arc<CloseSignal>,
    finished: bool,
}

impl OutboundReceiver {
    /// Next thing to write. A close request jumps ahead of queued frames
    /// and ends the channel; `None` also means every sender is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        if self.finished {
            return None;
        }
        let next = tokio::select! {
            biased;
            _ = self.close.requested.cancelled() => None,
            frame = self.frames.recv() => Some(frame),
        };
        match next {
            None => Some(self.finish()),
            Some(Some(message)) => Some(Outbound::Frame(message)),
            Some(None) => {
                self.finished = true;
                None
            }
        }
    }

    pub fn try_recv(&mut self) -> std::result::Result<Outbound, TryRecvError> {
        if self.finished {
            return Err(TryRecvError::Disconnected);
        }
        if self.close.requested.is_cancelled() {
            return Ok(self.finish());
        }
        self.frames.try_recv().map(Outbound::Frame)
    }

    fn finish(&mut self) -> Outbound {
        self.finished = true;
        self.frames.close();
        Outbound::Close(self.close.frame.lock().take())
    }
}

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Pending,
    Authenticated,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Pending, Authenticated)
                | (Pending, Closed)
                | (Authenticated, Active)
                | (Authenticated, Closing)
                | (Authenticated, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Authenticated => "authenticated",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity bound to a connection by the authentication gate
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Identity {
    pub name: String,
    /// Admitted through the bypass toggle rather than a credential check
    pub anonymous: bool,
}

impl Identity {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            anonymous: false,
        }
    }

    pub fn anonymous() -> Self {
        Self {
            name: "anonymous".to_string(),
            anonymous: true,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One live socket on an endpoint
pub struct Connection {
    id: String,
    endpoint: String,
    identity: Mutex<Option<Identity>>,
    state: Mutex<ConnectionState>,
    outbound: OutboundSender,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection in the `pending` state.
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, outbound: OutboundSender) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            identity: Mutex::new(None),
            state: Mutex::new(ConnectionState::Pending),
            outbound,
            peer: None,
            connected_at: Utc::now(),
        }
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time since the socket was opened
    pub fn connected_for(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    fn transition(&self, next: ConnectionState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(GatewayError::InvalidTransition {
                connection_id: self.id.clone(),
                from: *state,
                to: next,
            });
        }
        *state = next;
        Ok(())
    }

    /// Bind an identity: `pending -> authenticated`.
    pub(crate) fn authenticate(&self, identity: Identity) -> Result<()> {
        self.transition(ConnectionState::Authenticated)?;
        *self.identity.lock() = Some(identity);
        Ok(())
    }

    /// `authenticated -> active`
    pub(crate) fn activate(&self) -> Result<()> {
        self.transition(ConnectionState::Active)
    }

    /// Enter `closing`. Returns false if the connection was already closing or closed.
    pub(crate) fn begin_close(&self) -> bool {
        self.transition(ConnectionState::Closing).is_ok()
    }

    /// Enter the terminal state from wherever the connection is.
    /// Returns false if it was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        true
    }

    /// Queue a frame for the peer. Only active connections accept sends.
    pub fn send(&self, message: Message) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Active {
            return Err(GatewayError::SendFailure {
                connection_id: self.id.clone(),
                reason: format!("connection is {}", state),
            });
        }
        self.outbound
            .try_send(message)
            .map_err(|e| GatewayError::SendFailure {
                connection_id: self.id.clone(),
                reason: match e {
                    TrySendError::Full(_) => "outbound queue full".to_string(),
                    TrySendError::Closed(_) => "peer disconnected".to_string(),
                },
            })
    }

    /// Serialize a value as JSON and send it as a text frame.
    pub fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.send(Message::Text(json))
    }

    /// Ask the writer task to close the socket. Skipped once the connection is closed.
    pub(crate) fn close_socket(&self, frame: Option<CloseFrame<'static>>) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.outbound.close(frame);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity())
            .field("state", &self.state())
            .field("peer", &self.peer)
            .finish()
    }
}
