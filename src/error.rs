//! Error types for the broker
//!
//! Defines broker-level errors and outbound queue send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::types::RoomId;

/// Broker-level errors
///
/// Operational errors (decode/encode/transport) are routed to the error
/// listener and never stop the broker loop. `SelfRoom` and `BrokerClosed`
/// are returned directly to the caller. `Invariant` is the only fatal kind.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Received frame is not a valid message envelope
    #[error("Failed to decode message: {0}")]
    Decoding(#[source] serde_json::Error),

    /// Message content cannot be serialized
    #[error("Failed to encode message: {0}")]
    Encoding(#[source] serde_json::Error),

    /// Attempted to leave a client's personal room
    #[error("Cannot leave the personal room {0}")]
    SelfRoom(RoomId),

    /// The broker loop is gone (command channel closed)
    #[error("Broker is closed")]
    BrokerClosed,

    /// Registry corruption detected by the broker loop (fatal)
    #[error("Broker invariant violated: {0}")]
    Invariant(String),
}

impl BrokerError {
    /// Check whether this error must stop the broker loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Invariant(_))
    }
}

/// Message send errors
///
/// Occurs when a frame cannot be queued for a client.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The client is not draining its queue fast enough
    #[error("Queue full")]
    QueueFull,
}
