//! Configuration loading for cache policies.
//!
//! Policies are declared per key (or per dotted namespace) in a TOML file:
//!
//! ```toml
//! default_poll_interval_ms = 4000
//!
//! [policies."receipt.summary"]
//! expiration_ms = 300000
//! auto_refresh = false
//!
//! [policies."dispatch"]
//! expiration_ms = 2000
//! auto_refresh = true
//! ```
//!
//! All fields are required unless explicitly marked optional. No defaults.

use crate::error::ConfigError;
use crate::policy::RevalidationPolicy;
use crate::CacheKey;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    /// Poll cadence for auto-refresh policies that do not set their own.
    pub default_poll_interval_ms: u64,
    /// Policies keyed by cache key or dotted namespace.
    pub policies: BTreeMap<String, PolicyConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub expiration_ms: u64,
    pub auto_refresh: bool,
    pub poll_interval_ms: Option<u64>,
}

impl CacheSettings {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let settings = Self::from_path(&path)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_poll_interval_ms".to_string(),
                value: "0".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        for (key, policy) in &self.policies {
            if key.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "policies".to_string(),
                    value: key.clone(),
                    reason: "policy key must not be empty".to_string(),
                });
            }
            if policy.expiration_ms == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("policies.{}.expiration_ms", key),
                    value: "0".to_string(),
                    reason: "must be > 0".to_string(),
                });
            }
            if policy.poll_interval_ms == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: format!("policies.{}.poll_interval_ms", key),
                    value: "0".to_string(),
                    reason: "must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolve the policy for a key.
    ///
    /// An exact entry wins; otherwise the longest dotted parent with an
    /// entry applies.
    pub fn policy_for(&self, key: &CacheKey) -> Option<RevalidationPolicy> {
        if let Some(policy) = self.policies.get(key.as_str()) {
            return Some(self.resolve(policy));
        }
        key.parents()
            .find_map(|parent| self.policies.get(parent))
            .map(|policy| self.resolve(policy))
    }

    fn resolve(&self, policy: &PolicyConfig) -> RevalidationPolicy {
        let base = RevalidationPolicy::new(Duration::from_millis(policy.expiration_ms));
        if policy.auto_refresh {
            let poll = policy
                .poll_interval_ms
                .unwrap_or(self.default_poll_interval_ms);
            base.with_polling(Duration::from_millis(poll))
        } else {
            base
        }
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("FRESHET_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
