//! Configuration management for ratewindow.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RateWindowError, Result};
use crate::ratelimit::{LimitRule, RuleSet, DEFAULT_KEY_PREFIX};

/// Main configuration for a ratewindow process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateWindowConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rules declared inline
    #[serde(default)]
    pub rules: Vec<LimitRule>,

    /// Path to an additional YAML rules file; its rules win over inline ones
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Namespace for every key written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on one store call in milliseconds; 0 disables it
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    /// The per-call timeout, if enabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl RateWindowConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| RateWindowError::Config(e.to_string()))?;
        if config.store.key_prefix.contains(':') {
            return Err(RateWindowError::Config(format!(
                "key_prefix '{}' must not contain ':'",
                config.store.key_prefix
            )));
        }
        Ok(config)
    }

    /// Build the effective rule set: inline rules, then the rules file.
    pub fn load_rules(&self) -> Result<RuleSet> {
        let mut rules = RuleSet::from_rules(self.rules.clone())?;
        if let Some(path) = &self.rules_path {
            rules.merge(RuleSet::from_file(path)?);
        }
        rules.validate()?;
        Ok(rules)
    }
}
