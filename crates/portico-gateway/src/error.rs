//! Gateway error types

use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::auth::AuthError;
use crate::connection::ConnectionState;

/// Gateway-related errors
///
/// Everything except the transparent transport variants is local to a single
/// connection or a single upgrade attempt.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    #[error("Send failure on connection {connection_id}: {reason}")]
    SendFailure {
        connection_id: String,
        reason: String,
    },
    #[error("Protocol violation on connection {connection_id}: message received while {state}")]
    ProtocolViolation {
        connection_id: String,
        state: ConnectionState,
    },
    #[error("Invalid transition on connection {connection_id}: {from} -> {to}")]
    InvalidTransition {
        connection_id: String,
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("Connection {connection_id} belongs to {actual}, not {expected}")]
    EndpointMismatch {
        connection_id: String,
        expected: String,
        actual: String,
    },
    #[error("Duplicate endpoint: {0}")]
    DuplicateEndpoint(String),
    #[error("Endpoint at capacity: {0}")]
    CapacityExceeded(String),
    #[error("Gateway is shutting down")]
    ShuttingDown,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl GatewayError {
    /// Close code used when this error terminates an upgraded socket
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Unauthorized(_) => CloseCode::Policy,
            Self::CapacityExceeded(_) => CloseCode::Again,
            Self::ShuttingDown => CloseCode::Away,
            Self::ProtocolViolation { .. } => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }

    /// HTTP status used when this error refuses an upgrade request
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::CapacityExceeded(_) | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        let err: GatewayError = AuthError::MissingCredential.into();
        assert_eq!(err.close_code(), CloseCode::Policy);
        assert_eq!(
            GatewayError::CapacityExceeded("/ws".into()).close_code(),
            CloseCode::Again
        );
        assert_eq!(GatewayError::ShuttingDown.close_code(), CloseCode::Away);
        assert_eq!(
            GatewayError::DuplicateEndpoint("/ws".into()).close_code(),
            CloseCode::Error
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            GatewayError::UnknownEndpoint("/nope".into()).http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::ShuttingDown.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_display() {
        let err = GatewayError::ProtocolViolation {
            connection_id: "c1".into(),
            state: ConnectionState::Closing,
        };
        assert_eq!(
            err.to_string(),
            "Protocol violation on connection c1: message received while closing"
        );
        let err: GatewayError = AuthError::UnknownCredential.into();
        assert_eq!(err.to_string(), "Unauthorized: credential not recognised");
    }
}
