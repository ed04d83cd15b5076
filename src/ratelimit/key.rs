//! Store key generation for rate limited subjects.

use crate::error::{RateWindowError, Result};

/// Separator between key segments.
const SEPARATOR: char = ':';

/// A key that uniquely identifies the event set of one subject under one rule.
///
/// Rendered as `{prefix}:{rule}:{subject}`, always with all three segments.
/// Prefix and rule may not contain `:`, so the first two separators always
/// delimit them and the subject is free-form. An ad hoc check has an empty
/// rule segment (`{prefix}::{subject}`), which no named rule can produce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Namespace shared by every key this process writes
    pub prefix: String,
    /// Name of the rule the subject is limited by; empty for ad hoc checks
    pub rule: String,
    /// The rate limited subject, e.g. a client identity or route
    pub subject: String,
}

impl WindowKey {
    /// Create a new window key.
    ///
    /// The subject must not be empty. Prefix and rule must not contain `:`.
    pub fn new(prefix: &str, rule: &str, subject: &str) -> Result<Self> {
        if subject.is_empty() {
            return Err(RateWindowError::InvalidArgument(
                "subject must not be empty".to_string(),
            ));
        }
        for (what, segment) in [("prefix", prefix), ("rule", rule)] {
            if segment.contains(SEPARATOR) {
                return Err(RateWindowError::InvalidArgument(format!(
                    "{} '{}' must not contain '{}'",
                    what, segment, SEPARATOR
                )));
            }
        }

        Ok(Self {
            prefix: prefix.to_string(),
            rule: rule.to_string(),
            subject: subject.to_string(),
        })
    }

    /// Convert the key to the string stored in the backend.
    pub fn to_store_key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.prefix,
            self.rule,
            self.subject,
            sep = SEPARATOR
        )
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
