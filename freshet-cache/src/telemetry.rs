//! Tracing subscriber setup.

use freshet_core::{CacheError, CacheResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pretty" | "text" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives (e.g. "freshet_cache=debug,info")
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "freshet_cache=info,warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// Create TelemetryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `FRESHET_LOG`: filter directives (default: "freshet_cache=info,warn")
    /// - `FRESHET_LOG_FORMAT`: "pretty" or "json" (default: pretty)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            filter: std::env::var("FRESHET_LOG").unwrap_or(defaults.filter),
            format: std::env::var("FRESHET_LOG_FORMAT")
                .ok()
                .and_then(|s| LogFormat::parse(&s))
                .unwrap_or(defaults.format),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. Fails if the filter does not parse or a global
/// subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> CacheResult<()> {
    let env_filter = EnvFilter::try_new(&config.filter).map_err(|e| CacheError::Telemetry {
        reason: format!("invalid filter {:?}: {}", config.filter, e),
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| CacheError::Telemetry {
        reason: format!("failed to init subscriber: {}", e),
    })?;

    tracing::info!(filter = %config.filter, format = ?config.format, "Telemetry initialized");
    Ok(())
}
