//! Error types for the Shelf engine.

use crate::RecordId;
use thiserror::Error;

/// All possible errors from the Shelf engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("duplicate record id: {0}")]
    DuplicateRecord(RecordId),

    // Configuration errors
    #[error("invalid config value for '{key}': {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("malformed config: {0}")]
    MalformedConfig(String),

    // Resolution errors
    #[error("strategy not registered: {0}")]
    UnknownStrategy(String),
}

impl Error {
    pub(crate) fn invalid_config(key: &str, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::InvalidRecord("missing id".into());
        assert_eq!(err.to_string(), "invalid record: missing id");

        let err = Error::invalid_config("jitterFactor", "must be within 0..=1");
        assert_eq!(
            err.to_string(),
            "invalid config value for 'jitterFactor': must be within 0..=1"
        );

        let err = Error::UnknownStrategy("USE_LATEST_TIMESTAMP".into());
        assert_eq!(
            err.to_string(),
            "strategy not registered: USE_LATEST_TIMESTAMP"
        );
    }
}
