//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding control-channel messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// An inbound text frame was not valid JSON for the expected shape.
    #[error("invalid inbound message: {0}")]
    InvalidMessage(String),

    /// A command payload did not match the shape its action tag requires.
    #[error("invalid payload for action '{action}': {reason}")]
    InvalidPayload { action: String, reason: String },

    /// An outbound event failed to serialize.
    #[error("failed to encode outbound event: {0}")]
    Encode(String),
}
