//! Sync error types.

/// Errors that can occur while talking to the relay server.
#[derive(Debug)]
pub enum SyncError {
    /// Failed to connect to server
    ConnectionError(String),
    /// WebSocket error
    WebSocketError(String),
    /// Frame could not be encoded or decoded
    ProtocolError(String),
    /// The room already has an experiment
    JoinRejected(String),
    /// Join timeout
    JoinTimeout,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::ConnectionError(e) => write!(f, "Connection error: {}", e),
            SyncError::WebSocketError(e) => write!(f, "WebSocket error: {}", e),
            SyncError::ProtocolError(e) => write!(f, "Protocol error: {}", e),
            SyncError::JoinRejected(e) => write!(f, "Join rejected by relay: {}", e),
            SyncError::JoinTimeout => write!(f, "Timed out waiting for the relay to accept join"),
        }
    }
}

impl std::error::Error for SyncError {}
