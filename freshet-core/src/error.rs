//! Error types for FRESHET operations

use crate::CacheKey;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or FRESHET_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for cache operations.
///
/// Cloneable because a single load outcome is handed to every caller
/// waiting on that load.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Load failed for {key}: {source}")]
    LoadFailed {
        key: CacheKey,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("Load for {key} was abandoned before completing")]
    LoadAbandoned { key: CacheKey },

    #[error("Load for {key} was cancelled")]
    LoadCancelled { key: CacheKey },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Telemetry initialization failed: {reason}")]
    Telemetry { reason: String },
}

impl CacheError {
    /// Wrap a loader error.
    pub fn load_failed(key: CacheKey, source: BoxError) -> Self {
        Self::LoadFailed {
            key,
            source: Arc::from(source),
        }
    }

    /// Key the error relates to, if any.
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            Self::LoadFailed { key, .. }
            | Self::LoadAbandoned { key }
            | Self::LoadCancelled { key } => Some(key),
            Self::Config(_) | Self::Telemetry { .. } => None,
        }
    }

    /// Whether two errors describe the same load outcome.
    ///
    /// Waiters of one load receive clones of one error, so shared
    /// sources compare by pointer.
    pub fn same_outcome(&self, other: &CacheError) -> bool {
        match (self, other) {
            (
                Self::LoadFailed { key: a, source: sa },
                Self::LoadFailed { key: b, source: sb },
            ) => a == b && Arc::ptr_eq(sa, sb),
            _ => self.to_string() == other.to_string(),
        }
    }
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("connection reset")]
    struct NetworkError;

    #[test]
    fn test_load_failed_display_includes_key_and_source() {
        let err = CacheError::load_failed(CacheKey::new("receipt.summary"), Box::new(NetworkError));
        let msg = format!("{}", err);
        assert!(msg.contains("receipt.summary"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_load_failed_exposes_source() {
        let err = CacheError::load_failed(CacheKey::new("k"), Box::new(NetworkError));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_clones_share_outcome() {
        let err = CacheError::load_failed(CacheKey::new("k"), Box::new(NetworkError));
        let clone = err.clone();
        assert!(err.same_outcome(&clone));

        let other = CacheError::load_failed(CacheKey::new("k"), Box::new(NetworkError));
        assert!(!err.same_outcome(&other));
    }

    #[test]
    fn test_key_accessor() {
        let err = CacheError::LoadAbandoned {
            key: CacheKey::new("dispatch.list"),
        };
        assert_eq!(err.key().map(CacheKey::as_str), Some("dispatch.list"));

        let config = CacheError::from(ConfigError::MissingConfigPath);
        assert!(config.key().is_none());
        assert!(matches!(config, CacheError::Config(_)));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "expiration_ms".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("expiration_ms"));
        assert!(msg.contains("must be positive"));
    }
}
