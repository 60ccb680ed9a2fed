//! Test helpers shared by unit tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{outbound_channel, Connection, Identity, OutboundReceiver};
use crate::handler::EndpointHandler;
use crate::registry::Registry;

/// An active connection with its outbound receiver
pub fn active_connection(id: &str, endpoint: &str) -> (Arc<Connection>, OutboundReceiver) {
    let (tx, rx) = outbound_channel(8);
    let connection = Connection::new(id, endpoint, tx);
    connection.authenticate(Identity::user("alice")).unwrap();
    connection.activate().unwrap();
    (Arc::new(connection), rx)
}

/// Handler that records every callback
#[derive(Default)]
pub struct RecordingHandler {
    opened: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
    changed: Notify,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    pub async fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub async fn closed(&self) -> Vec<String> {
        self.closed.lock().clone()
    }

    /// Wait until at least `count` connections have been closed.
    pub async fn wait_closed(&self, count: usize) {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                if self.closed.lock().len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for close");
    }
}

#[async_trait]
impl EndpointHandler for RecordingHandler {
    async fn on_open(&self, _registry: &Registry, connection: &Arc<Connection>) {
        self.opened.lock().push(connection.id().to_string());
        self.changed.notify_waiters();
    }

    async fn on_message(&self, _registry: &Registry, _connection: &Arc<Connection>, message: Message) {
        self.messages
            .lock()
            .push(message.into_text().unwrap_or_default());
        self.changed.notify_waiters();
    }

    async fn on_close(&self, _registry: &Registry, connection: &Arc<Connection>) {
        self.closed.lock().push(connection.id().to_string());
        self.changed.notify_waiters();
    }
}
