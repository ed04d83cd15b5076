//! Named limit rules and their configuration.
//!
//! A rule pairs a limit with a window length under a name, so callers ask
//! "is `client_a` over the `login` limit?" instead of passing raw numbers
//! on every call. Rules are loaded from YAML, either as a bare list or
//! under a `rules:` key.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateWindowError, Result};

/// A set of named rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<LimitRule>,
}

/// A limit applied to every subject checked under this rule's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Name callers refer to the rule by; also part of the store key
    pub name: String,
    /// Events allowed within the window before the subject is over limit
    pub limit: u64,
    /// Length of the trailing window in milliseconds
    pub window_ms: u64,
    /// Optional human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl LimitRule {
    /// Create a rule. The window must be at least one millisecond and fit
    /// in a `u64` count of milliseconds.
    pub fn new(name: &str, limit: u64, window: Duration) -> Result<Self> {
        let window_ms = u64::try_from(window.as_millis()).map_err(|_| {
            RateWindowError::InvalidArgument(format!("window {:?} is too large", window))
        })?;
        if window_ms == 0 {
            return Err(RateWindowError::InvalidArgument(format!(
                "window {:?} is shorter than one millisecond",
                window
            )));
        }

        Ok(Self {
            name: name.to_string(),
            limit,
            window_ms,
            description: None,
        })
    }

    /// The trailing window this rule counts over.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a rule set from rules, validating them.
    pub fn from_rules(rules: Vec<LimitRule>) -> Result<Self> {
        let set = Self { rules };
        set.validate()?;
        Ok(set)
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // First, try a bare list of rules
        if let Ok(rules) = serde_yaml::from_str::<Vec<LimitRule>>(yaml) {
            return Self::from_rules(rules);
        }

        // Otherwise, expect the rules under a `rules:` key
        let set: RuleSet = serde_yaml::from_str(yaml)
            .map_err(|e| RateWindowError::Config(format!("Failed to parse limit rules: {}", e)))?;
        set.validate()?;
        Ok(set)
    }

    /// Check that every rule is usable and names are unique.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.name.is_empty() {
                return Err(RateWindowError::Config(
                    "limit rule with empty name".to_string(),
                ));
            }
            if rule.name.contains(':') {
                return Err(RateWindowError::Config(format!(
                    "limit rule name '{}' must not contain ':'",
                    rule.name
                )));
            }
            if rule.window_ms == 0 {
                return Err(RateWindowError::Config(format!(
                    "limit rule '{}' has a zero window",
                    rule.name
                )));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(RateWindowError::Config(format!(
                    "duplicate limit rule '{}'",
                    rule.name
                )));
            }
        }
        Ok(())
    }

    /// Find a rule by name.
    pub fn find(&self, name: &str) -> Option<&LimitRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    /// Add rules from `other`, replacing same-named ones.
    pub fn merge(&mut self, other: RuleSet) {
        for rule in other.rules {
            match self.rules.iter_mut().find(|r| r.name == rule.name) {
                Some(existing) => *existing = rule,
                None => self.rules.push(rule),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule_list() {
        let yaml = r#"
- name: login
  limit: 10
  window_ms: 1000
- name: search
  limit: 100
  window_ms: 60000
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.find("search").unwrap().window(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_rules_key() {
        let yaml = r#"
rules:
  - name: login
    limit: 10
    window_ms: 1000
    description: Password attempts per client
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        let login = rules.find("login").unwrap();
        assert_eq!(login.limit, 10);
        assert_eq!(login.window(), Duration::from_secs(1));
        assert_eq!(
            login.description.as_deref(),
            Some("Password attempts per client")
        );
    }

    #[test]
    fn test_find_missing_rule() {
        let rules =
            RuleSet::from_rules(vec![LimitRule::new("login", 10, Duration::from_secs(1)).unwrap()])
                .unwrap();
        assert!(rules.find("other").is_none());
    }

    #[test]
    fn test_zero_window_rejected() {
        let yaml = r#"
- name: broken
  limit: 10
  window_ms: 0
"#;
        let result = RuleSet::from_yaml(yaml);
        assert!(matches!(result, Err(RateWindowError::Config(_))));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = RuleSet::from_rules(vec![
            LimitRule::new("login", 10, Duration::from_secs(1)).unwrap(),
            LimitRule::new("login", 20, Duration::from_secs(2)).unwrap(),
        ]);
        assert!(matches!(result, Err(RateWindowError::Config(_))));
    }

    #[test]
    fn test_separator_in_name_rejected() {
        let yaml = r#"
- name: "login:v2"
  limit: 10
  window_ms: 1000
"#;
        let result = RuleSet::from_yaml(yaml);
        assert!(matches!(result, Err(RateWindowError::Config(_))));
    }

    #[test]
    fn test_new_rejects_unrepresentable_windows() {
        let result = LimitRule::new("fast", 10, Duration::from_micros(500));
        assert!(matches!(result, Err(RateWindowError::InvalidArgument(_))));

        let result = LimitRule::new("forever", 10, Duration::MAX);
        assert!(matches!(result, Err(RateWindowError::InvalidArgument(_))));

        let rule = LimitRule::new("edge", 10, Duration::from_micros(1500)).unwrap();
        assert_eq!(rule.window_ms, 1);
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        let result = RuleSet::from_yaml("rules: [not, a, rule]");
        assert!(matches!(result, Err(RateWindowError::Config(_))));
    }

    #[test]
    fn test_merge_replaces_same_name() {
        let mut rules = RuleSet::from_rules(vec![
            LimitRule::new("login", 10, Duration::from_secs(1)).unwrap(),
            LimitRule::new("search", 100, Duration::from_secs(60)).unwrap(),
        ])
        .unwrap();

        rules.merge(
            RuleSet::from_rules(vec![
                LimitRule::new("login", 5, Duration::from_secs(1)).unwrap(),
                LimitRule::new("upload", 3, Duration::from_secs(10)).unwrap(),
            ])
            .unwrap(),
        );

        assert_eq!(rules.len(), 3);
        assert_eq!(rules.find("login").unwrap().limit, 5);
        assert_eq!(rules.find("upload").unwrap().limit, 3);
    }
}
