//! IPC error types

use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IO error
    #[error("io error: {0}")]
    Io(String),

    /// Control channel closed by the peer
    #[error("connection closed")]
    ConnectionClosed,

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// Invalid message format
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Side-channel connect, read or bind failure
    #[error("side channel error: {0}")]
    SideChannel(String),

    /// Event payloads are text-only; they cannot carry buffers or streams
    #[error("event payload carries binary side data")]
    EventPayload,
}

impl IpcError {
    /// Whether the failure is transient from the transport's point of view
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IpcError::Io(_) | IpcError::ConnectionClosed | IpcError::SideChannel(_)
        )
    }

    /// Whether the failure indicates the peer speaks a different protocol
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IpcError::VersionMismatch { .. } | IpcError::InvalidMessage(_)
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::Io(err.to_string())
        } else if err.is_data() {
            IpcError::Deserialization(err.to_string())
        } else {
            IpcError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(IpcError::Io("pipe".into()).is_retryable());
        assert!(IpcError::ConnectionClosed.is_retryable());
        assert!(!IpcError::VersionMismatch {
            expected: 1,
            actual: 2
        }
        .is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(IpcError::InvalidMessage("bad".into()).is_fatal());
        assert!(!IpcError::ConnectionClosed.is_fatal());
    }
}
