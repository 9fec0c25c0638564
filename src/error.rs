use thiserror::Error;

/// Errors surfaced by gantry services.
///
/// Mutators return `Ok(None)` / `Ok(false)` when the target record is
/// missing; they only error on invariant violations, crypto failures,
/// and I/O.
#[derive(Debug, Error)]
pub enum GantryError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {reason}")]
    AccessDenied {
        reason: String,
        matched_rules: Vec<String>,
    },

    #[error("invalid master key")]
    InvalidMasterKey,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("git error: {0}")]
    Git(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GantryError {
    /// Denial with the policy/rule context that produced it.
    pub fn denied(reason: impl Into<String>, matched_rules: Vec<String>) -> Self {
        GantryError::AccessDenied {
            reason: reason.into(),
            matched_rules,
        }
    }
}

pub type Result<T> = std::result::Result<T, GantryError>;
