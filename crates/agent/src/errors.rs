//! Agent error types and control-channel fault classification.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Per-connection control-channel faults.
///
/// The variant decides the reconnect policy: an abrupt disconnect or
/// transport failure reconnects immediately, while a controller that
/// actively refuses the handshake gets an extended backoff so the agent
/// does not hammer it.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The peer closed the connection or the pipe broke mid-transfer.
    #[error("disconnected from controller: {0}")]
    Disconnected(String),

    /// Handshake rejected with an HTTP status code.
    #[error("rejected by controller with status {status}")]
    Rejected { status: u16 },

    /// A non-text frame arrived on the wire. The framing contract is one
    /// self-describing text message per event, so this is fatal for the
    /// connection.
    #[error("non-text frame received on control channel")]
    NonTextFrame,

    /// Anything else. Logged with full detail, never a crash.
    #[error("unexpected control channel fault: {0}")]
    Unexpected(String),
}

impl GatewayError {
    /// Classify a websocket error into a reconnect policy bucket.
    pub fn classify(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                GatewayError::Disconnected("connection closed".to_string())
            }
            tungstenite::Error::Io(e) => GatewayError::Disconnected(e.to_string()),
            tungstenite::Error::Protocol(e) => GatewayError::Disconnected(e.to_string()),
            tungstenite::Error::Http(response) => GatewayError::Rejected {
                status: response.status().as_u16(),
            },
            other => GatewayError::Unexpected(other.to_string()),
        }
    }

    /// Delay before the next reconnect attempt.
    pub fn reconnect_delay(&self, rejected_backoff: Duration) -> Duration {
        match self {
            GatewayError::Rejected { .. } => rejected_backoff,
            _ => Duration::ZERO,
        }
    }
}
