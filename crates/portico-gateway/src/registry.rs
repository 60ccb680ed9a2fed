//! Per-endpoint connection registry
//!
//! Tracks the live connections of one endpoint and fans messages out to
//! them. Message contents are never inspected.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{GatewayError, Result};

/// Outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Connections whose send failed; each was scheduled for removal
    pub failed: Vec<String>,
}

/// Live connections of one endpoint, keyed by connection id
#[derive(Debug, Clone)]
pub struct Registry {
    endpoint: Arc<str>,
    connections: Arc<DashMap<String, Arc<Connection>>>,
    /// Where failed connections are reported for teardown
    evictions: Option<mpsc::UnboundedSender<String>>,
}

impl Registry {
    /// Create a registry that removes failed connections itself.
    pub fn new(endpoint: impl Into<Arc<str>>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connections: Arc::new(DashMap::new()),
            evictions: None,
        }
    }

    /// Create a registry that hands failed connections to an owner for teardown.
    pub fn with_evictions(
        endpoint: impl Into<Arc<str>>,
        evictions: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            evictions: Some(evictions),
            ..Self::new(endpoint)
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Add a connection, replacing any entry with the same id.
    pub fn add(&self, connection: Arc<Connection>) -> Result<Option<Arc<Connection>>> {
        if connection.endpoint() != &*self.endpoint {
            return Err(GatewayError::EndpointMismatch {
                connection_id: connection.id().to_string(),
                expected: self.endpoint.to_string(),
                actual: connection.endpoint().to_string(),
            });
        }
        let replaced = self
            .connections
            .insert(connection.id().to_string(), connection);
        if let Some(ref old) = replaced {
            debug!(endpoint = %self.endpoint, conn_id = %old.id(), "replaced connection with same id");
        }
        Ok(replaced)
    }

    /// Remove a connection. Removing an absent id is a no-op.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .remove(connection_id)
            .map(|(_, connection)| connection)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Snapshot of every registered connection
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send `message` to every active connection matching `predicate`.
    ///
    /// Destinations are snapshotted first, so connections removed mid-way
    /// are harmless. A failed send is logged, does not stop delivery to the
    /// rest, and schedules that connection for removal.
    pub fn broadcast<P>(&self, message: Message, predicate: P) -> BroadcastReport
    where
        P: Fn(&Connection) -> bool,
    {
        let targets: Vec<Arc<Connection>> = self
            .all()
            .into_iter()
            .filter(|connection| connection.is_active() && predicate(connection))
            .collect();

        let mut report = BroadcastReport::default();
        for connection in targets {
            match connection.send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, conn_id = %connection.id(), error = %e, "broadcast send failed");
                    self.evict(&connection);
                    report.failed.push(connection.id().to_string());
                }
            }
        }

        debug!(
            endpoint = %self.endpoint,
            delivered = report.delivered,
            failed = report.failed.len(),
            "broadcast complete"
        );
        report
    }

    /// Broadcast to every active connection.
    pub fn broadcast_all(&self, message: Message) -> BroadcastReport {
        self.broadcast(message, |_| true)
    }

    fn evict(&self, connection: &Arc<Connection>) {
        connection.begin_close();
        let handed_off = self
            .evictions
            .as_ref()
            .map(|tx| tx.send(connection.id().to_string()).is_ok())
            .unwrap_or(false);
        if !handed_off && self.remove(connection.id()).is_some() {
            connection.close_socket(None);
            connection.mark_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{outbound_channel, ConnectionState, Identity, Outbound, OutboundReceiver};

    fn make_active(id: &str, endpoint: &str) -> (Arc<Connection>, OutboundReceiver) {
        let (tx, rx) = outbound_channel(8);
        let connection = Connection::new(id, endpoint, tx);
        connection.authenticate(Identity::user("alice")).unwrap();
        connection.activate().unwrap();
        (Arc::new(connection), rx)
    }

    fn text(message: &str) -> Message {
        Message::Text(message.to_string())
    }

    #[test]
    fn add_and_get() {
        let registry = Registry::new("/ws");
        let (conn, _rx) = make_active("c1", "/ws");
        assert!(registry.add(conn).unwrap().is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("c1").unwrap().id(), "c1");
        assert!(registry.get("c2").is_none());
    }

    #[test]
    fn add_replaces_same_id() {
        let registry = Registry::new("/ws");
        let (first, _rx1) = make_active("same", "/ws");
        let (second, _rx2) = make_active("same", "/ws");
        registry.add(Arc::clone(&first)).unwrap();
        let replaced = registry.add(Arc::clone(&second)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("same").unwrap(), &second));
    }

    #[test]
    fn add_rejects_other_endpoint() {
        let registry = Registry::new("/ws");
        let (conn, _rx) = make_active("c1", "/ws-admin");
        assert!(matches!(
            registry.add(conn),
            Err(GatewayError::EndpointMismatch { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new("/ws");
        let (conn, _rx) = make_active("c1", "/ws");
        registry.add(conn).unwrap();
        assert!(registry.remove("c1").is_some());
        assert!(registry.remove("c1").is_none());
        assert!(registry.remove("never").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_reaches_active_connections_only() {
        let registry = Registry::new("/ws");
        let (c1, mut rx1) = make_active("c1", "/ws");
        let (c2, mut rx2) = make_active("c2", "/ws");
        registry.add(c1).unwrap();
        registry.add(Arc::clone(&c2)).unwrap();
        c2.begin_close();

        let report = registry.broadcast_all(text("hi"));
        assert_eq!(report.delivered, 1);
        assert!(report.failed.is_empty());
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn broadcast_with_predicate() {
        let registry = Registry::new("/ws");
        let (c1, mut rx1) = make_active("c1", "/ws");
        let (c2, mut rx2) = make_active("c2", "/ws");
        registry.add(c1).unwrap();
        registry.add(c2).unwrap();

        let report = registry.broadcast(text("not for c1"), |c| c.id() != "c1");
        assert_eq!(report.delivered, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn failed_send_does_not_abort_broadcast() {
        let registry = Registry::new("/ws");
        let (c1, rx1) = make_active("c1", "/ws");
        let (c2, mut rx2) = make_active("c2", "/ws");
        let (c3, mut rx3) = make_active("c3", "/ws");
        registry.add(Arc::clone(&c1)).unwrap();
        registry.add(c2).unwrap();
        registry.add(c3).unwrap();
        drop(rx1);

        let report = registry.broadcast_all(text("hello"));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec!["c1".to_string()]);
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());

        // No eviction channel: the registry removed it directly
        assert!(!registry.contains("c1"));
        assert_eq!(c1.state(), ConnectionState::Closed);
    }

    #[test]
    fn full_queue_eviction_still_closes_socket() {
        let registry = Registry::new("/ws");
        let (tx, mut rx) = outbound_channel(1);
        let conn = Connection::new("c1", "/ws", tx);
        conn.authenticate(Identity::user("alice")).unwrap();
        conn.activate().unwrap();
        registry.add(Arc::new(conn)).unwrap();

        assert_eq!(registry.broadcast_all(text("fills the queue")).delivered, 1);
        let report = registry.broadcast_all(text("overflows"));
        assert_eq!(report.failed, vec!["c1".to_string()]);
        assert!(registry.is_empty());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close(None))));
    }

    #[test]
    fn failed_send_is_handed_to_owner() {
        let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
        let registry = Registry::with_evictions("/ws", evict_tx);
        let (c1, rx1) = make_active("c1", "/ws");
        registry.add(Arc::clone(&c1)).unwrap();
        drop(rx1);

        let report = registry.broadcast_all(text("hello"));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(evict_rx.try_recv().unwrap(), "c1");
        // Still registered until the owner tears it down, but no longer sendable
        assert!(registry.contains("c1"));
        assert_eq!(c1.state(), ConnectionState::Closing);
    }

    #[test]
    fn registries_are_isolated() {
        let ws = Registry::new("/ws");
        let admin = Registry::new("/ws-admin");
        let (c1, mut rx1) = make_active("c1", "/ws");
        let (c2, mut rx2) = make_active("c2", "/ws-admin");
        ws.add(c1).unwrap();
        admin.add(c2).unwrap();

        ws.broadcast_all(text("for /ws"));
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn clones_share_state() {
        let registry = Registry::new("/ws");
        let clone = registry.clone();
        let (conn, _rx) = make_active("c1", "/ws");
        registry.add(conn).unwrap();
        assert!(clone.contains("c1"));
        assert_eq!(clone.all().len(), 1);
    }
}
