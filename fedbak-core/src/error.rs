use thiserror::Error;

pub type Result<T> = std::result::Result<T, BakError>;

#[derive(Error, Debug)]
pub enum BakError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Insufficient capacity: {0}")]
    CapacityExceeded(String),

    #[error("Peer request failed: {0}")]
    PeerHttp(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for BakError {
    fn from(err: reqwest::Error) -> Self {
        BakError::PeerHttp(err.to_string())
    }
}

impl BakError {
    /// Whether the error represents a missing remote resource. The
    /// propagation worker treats a remote delete of an already-deleted
    /// block as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BakError::NotFound(_))
    }
}
