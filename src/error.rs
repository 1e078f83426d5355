use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine-wide error set, grouped by effect rather than by layer. The
/// protocol surface maps these onto outbound `Message` frames; see
/// `server::message`.
#[derive(Debug, Error)]
pub enum EngineError {
    // Validation
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unknown action type: {0}")]
    UnknownType(String),
    #[error("invalid id: {0}")]
    BadId(String),

    // Authorization
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    // Optimistic-concurrency conflicts; both carry the server head so the
    // client can rebase.
    #[error("stale base revision")]
    StaleBase { head: String },
    #[error("History divergence")]
    Divergent { head: String },

    // Consensus
    #[error("not the leader")]
    NotLeader { leader: Option<String> },
    #[error("consensus timeout")]
    Timeout,
    #[error("leader unavailable")]
    Unavailable,

    // Storage
    #[error("not found: {0}")]
    NotExist(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt entity: {0}")]
    Corrupt(String),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),

    // Crypto
    #[error("decryption failed with every ring key")]
    DecryptFailed,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Conflicts surface as CONFLICT frames, never as transport errors.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::StaleBase { .. } | EngineError::Divergent { .. }
        )
    }

    pub fn conflict_head(&self) -> Option<&str> {
        match self {
            EngineError::StaleBase { head } | EngineError::Divergent { head } => {
                Some(head.as_str())
            }
            _ => None,
        }
    }
}
