//! Configuration management for the sync service.

use std::env;

use shelf_engine::ReconcileConfig;

/// Default `RUST_LOG` filter for the binary.
pub const DEFAULT_LOG_FILTER: &str = "shelf_sync=debug";

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Engine and orchestrator options
    pub reconcile: ReconcileConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `SHELF_CONFIG` names an optional JSON options file. Individual keys
    /// can be overridden with `SHELF_MAX_CONCURRENT_SYNCS`,
    /// `SHELF_AUTO_RESOLVE_THRESHOLD` and `SHELF_SOURCE_PRIORITY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut reconcile = match lookup("SHELF_CONFIG") {
            Some(path) => {
                let json = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                ReconcileConfig::from_json_str(&json)?
            }
            None => ReconcileConfig::default(),
        };

        if let Some(value) = lookup("SHELF_MAX_CONCURRENT_SYNCS") {
            reconcile.max_concurrent_syncs = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("SHELF_MAX_CONCURRENT_SYNCS", &value))?;
        }

        if let Some(value) = lookup("SHELF_AUTO_RESOLVE_THRESHOLD") {
            reconcile.auto_resolve_threshold = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid("SHELF_AUTO_RESOLVE_THRESHOLD", &value))?;
        }

        if let Some(value) = lookup("SHELF_SOURCE_PRIORITY") {
            reconcile.source_priority = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        reconcile.validate()?;
        Ok(Self { reconcile })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Invalid {key} value: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error(transparent)]
    Engine(#[from] shelf_engine::Error),
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str) -> Self {
        ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }
    }
}

impl From<ConfigError> for crate::SyncError {
    fn from(err: ConfigError) -> Self {
        crate::SyncError::Config(err.to_string())
    }
}
