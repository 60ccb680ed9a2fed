//! Server-originated notices
//!
//! Client payloads are opaque to the gateway; these are the only frames the
//! gateway itself produces.

use serde::{Deserialize, Serialize};

/// Notices sent from gateway to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerNotice {
    /// Connection is active on an endpoint
    Welcome {
        /// Connection ID assigned by the gateway
        connection_id: String,
        /// Endpoint the client connected to
        endpoint: String,
        /// Authenticated identity
        identity: String,
        /// Admitted through the authentication bypass
        anonymous: bool,
    },
}
