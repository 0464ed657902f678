use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventerError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Node id is {0} bytes, limit is 65535")]
    NodeIdTooLong(usize),

    #[error("Node id must be ASCII: {0:?}")]
    InvalidNodeId(String),

    #[error("Payload is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage task failed: {0}")]
    StorageTask(#[from] tokio::task::JoinError),

    #[error("Timed out talking to {0}")]
    Timeout(String),

    #[error("Peer {0} unreachable")]
    PeerUnreachable(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EventerError {
    /// Transient network faults: the peer is treated as currently unavailable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EventerError::Timeout(_) | EventerError::PeerUnreachable(_) | EventerError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EventerError>;
