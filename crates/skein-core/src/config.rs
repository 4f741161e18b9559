//! Broker configuration.
//!
//! Precedence: built-in defaults, then the TOML file, then `SKEIN_*`
//! environment variables.
//!
//! ```toml
//! stale_processing = "wait"      # or "redispatch"
//! notification_capacity = 1024
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::impls::DEFAULT_NOTIFICATION_CAPACITY;

/// What to do when the head of a queue changed identity while its previous
/// head is still `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleProcessingPolicy {
    /// Never start a second dispatch for the queue while one is in flight.
    /// The new head is dispatched once the running handler completes.
    #[default]
    Wait,

    /// Dispatch the new head right away. Two handler invocations for the same
    /// queue may briefly overlap.
    Redispatch,
}

impl std::str::FromStr for StaleProcessingPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(StaleProcessingPolicy::Wait),
            "redispatch" => Ok(StaleProcessingPolicy::Redispatch),
            other => Err(ConfigError::Parse(format!(
                "unknown stale_processing policy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub stale_processing: StaleProcessingPolicy,

    /// Broadcast capacity of the commit notification channel for stores
    /// opened from this config.
    pub notification_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stale_processing: StaleProcessingPolicy::default(),
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

impl BrokerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(raw)?;
        config.validate()
    }

    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// [`BrokerConfig::load`] with overrides taken from `lookup`.
    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_toml_str(&fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.with_overrides(lookup)
    }

    /// Apply `SKEIN_STALE_PROCESSING` / `SKEIN_NOTIFICATION_CAPACITY` from
    /// `lookup` (normally the process environment).
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("SKEIN_STALE_PROCESSING") {
            self.stale_processing = v.parse()?;
        }
        if let Some(v) = lookup("SKEIN_NOTIFICATION_CAPACITY") {
            self.notification_capacity = v
                .trim()
                .parse()
                .map_err(|e| ConfigError::Parse(format!("SKEIN_NOTIFICATION_CAPACITY: {e}")))?;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.notification_capacity == 0 {
            return Err(ConfigError::Parse(
                "notification_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = BrokerConfig::from_toml_str("").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.stale_processing, StaleProcessingPolicy::Wait);
    }

    #[test]
    fn toml_sets_policy_and_capacity() {
        let config = BrokerConfig::from_toml_str(
            r#"
            stale_processing = "redispatch"
            notification_capacity = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.stale_processing, StaleProcessingPolicy::Redispatch);
        assert_eq!(config.notification_capacity, 16);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = BrokerConfig::from_toml_str("retry = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = BrokerConfig::from_toml_str("notification_capacity = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("SKEIN_STALE_PROCESSING", "Redispatch"),
            ("SKEIN_NOTIFICATION_CAPACITY", " 8 "),
        ]
        .into_iter()
        .collect();

        let config = BrokerConfig::default()
            .with_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.stale_processing, StaleProcessingPolicy::Redispatch);
        assert_eq!(config.notification_capacity, 8);
    }

    #[test]
    fn bad_env_value_is_reported() {
        let err = BrokerConfig::default()
            .with_overrides(|name| (name == "SKEIN_STALE_PROCESSING").then(|| "sometimes".into()))
            .unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("skein.toml");
        std::fs::write(&path, "notification_capacity = 32\n").unwrap();

        let config = BrokerConfig::load_with(Some(&path), |_| None).unwrap();
        assert_eq!(config.notification_capacity, 32);
        assert_eq!(config.stale_processing, StaleProcessingPolicy::Wait);

        // 環境変数はファイルより優先
        let overridden = BrokerConfig::load_with(Some(&path), |name| {
            (name == "SKEIN_NOTIFICATION_CAPACITY").then(|| "64".into())
        })
        .unwrap();
        assert_eq!(overridden.notification_capacity, 64);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(BrokerConfig::load_with(Some(&missing), |_| None).is_err());
    }
}
