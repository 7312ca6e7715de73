//! Error types for the relay and its clients

use thiserror::Error;

/// Errors on a single transport connection
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Undecodable record: {line}")]
    Decode {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Record is not valid UTF-8")]
    InvalidUtf8,

    #[error("Unterminated frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Send timed out after {ms}ms")]
    SendTimeout { ms: u64 },

    #[error("Serialization error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Relay channel closed")]
    ChannelClosed,

    #[error("Not connected to the coordinator")]
    NotConnected,

    #[error("Endpoint evicted for not draining its queue")]
    Evicted,
}

/// Why a message could not be handed to a named endpoint
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Endpoint '{0}' is not registered")]
    NotRegistered(String),

    #[error("Endpoint '{0}' has a full queue")]
    Stalled(String),

    #[error("Writer for '{0}' has stopped")]
    Closed(String),
}

impl DeliveryError {
    pub fn endpoint(&self) -> &str {
        match self {
            DeliveryError::NotRegistered(name) | DeliveryError::Stalled(name) | DeliveryError::Closed(name) => name,
        }
    }
}
