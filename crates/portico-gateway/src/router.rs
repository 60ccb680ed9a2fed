//! Dispatch router
//!
//! Maps request paths to endpoint managers. The table is fixed at
//! construction; a path that was not registered is never served.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::auth::RequestContext;
use crate::connection::{Connection, OutboundSender};
use crate::endpoint::EndpointManager;
use crate::error::{GatewayError, Result};

/// An upgrade request that matched an endpoint
#[derive(Debug, Clone)]
pub struct UpgradeTicket {
    pub endpoint: String,
    pub context: RequestContext,
}

/// Routes socket events to the manager that owns the endpoint
#[derive(Debug)]
pub struct DispatchRouter {
    table: HashMap<String, EndpointManager>,
    stopped: AtomicBool,
}

impl DispatchRouter {
    /// Build the routing table. Two managers for the same path is a fatal
    /// configuration error.
    pub fn new(managers: impl IntoIterator<Item = EndpointManager>) -> Result<Self> {
        let mut table = HashMap::new();
        for manager in managers {
            let endpoint = manager.endpoint().to_string();
            if table.contains_key(&endpoint) {
                return Err(GatewayError::DuplicateEndpoint(endpoint));
            }
            debug!(endpoint = %endpoint, "endpoint registered");
            table.insert(endpoint, manager);
        }
        Ok(Self {
            table,
            stopped: AtomicBool::new(false),
        })
    }

    /// Decide whether an upgrade request may proceed.
    pub fn handle_upgrade(&self, context: &RequestContext) -> Result<UpgradeTicket> {
        if self.is_stopped() {
            return Err(GatewayError::ShuttingDown);
        }
        if !self.table.contains_key(&context.path) {
            warn!(path = %context.path, "upgrade rejected: unknown endpoint");
            return Err(GatewayError::UnknownEndpoint(context.path.clone()));
        }
        Ok(UpgradeTicket {
            endpoint: context.path.clone(),
            context: context.clone(),
        })
    }

    /// Open event for an upgraded socket.
    pub async fn open(
        &self,
        ticket: UpgradeTicket,
        outbound: OutboundSender,
    ) -> Result<Arc<Connection>> {
        let manager = self.lookup(&ticket.endpoint)?;
        manager.open(ticket.context, outbound).await
    }

    pub async fn message(&self, endpoint: &str, connection_id: &str, message: Message) {
        if let Some(manager) = self.table.get(endpoint) {
            manager.message(connection_id, message).await;
        }
    }

    pub async fn close(&self, endpoint: &str, connection_id: &str) {
        if let Some(manager) = self.table.get(endpoint) {
            manager.close(connection_id).await;
        }
    }

    pub async fn error(&self, endpoint: &str, connection_id: &str, reason: impl Into<String>) {
        if let Some(manager) = self.table.get(endpoint) {
            manager.error(connection_id, reason).await;
        }
    }

    pub fn manager(&self, endpoint: &str) -> Option<&EndpointManager> {
        self.table.get(endpoint)
    }

    /// Registered paths, sorted
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.table.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Live connection count per endpoint, sorted by path
    pub fn connection_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = self
            .table
            .iter()
            .map(|(endpoint, manager)| (endpoint.clone(), manager.connection_count()))
            .collect();
        counts.sort();
        counts
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop accepting upgrades and shut every endpoint down.
    ///
    /// Returns the number of connections closed. Only the first call does
    /// any work.
    pub async fn stop(&self, grace: Duration) -> usize {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("router already stopped");
            return 0;
        }
        info!(endpoints = self.table.len(), "stopping router");
        let closed: usize = join_all(self.table.values().map(|manager| manager.shutdown(grace)))
            .await
            .into_iter()
            .sum();
        info!(closed, "router stopped");
        closed
    }

    fn lookup(&self, endpoint: &str) -> Result<&EndpointManager> {
        if self.is_stopped() {
            return Err(GatewayError::ShuttingDown);
        }
        self.table
            .get(endpoint)
            .ok_or_else(|| GatewayError::UnknownEndpoint(endpoint.to_string()))
    }
}
