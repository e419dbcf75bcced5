use crate::domain::{OpKind, Platform};

/// Core error type for Herald.
///
/// Adapter crates map their specific errors into this type so the engine can
/// decide per class whether a failure is fatal (config) or skip-and-log.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("daily {op} quota exhausted for {platform}")]
    QuotaExceeded { platform: Platform, op: OpKind },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("generation error: {0}")]
    Generation(String),

    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Expected conditions that are logged quietly rather than as failures.
    pub fn is_quota(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
