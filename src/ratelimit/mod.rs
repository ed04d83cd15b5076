//! Sliding-window rate limiting.

mod counter;
mod key;
mod limiter;
mod rules;

pub use counter::{check_and_record, WindowCounter, WindowStatus};
pub use key::WindowKey;
pub use limiter::{or_fail_open, OverallStatus, RateLimiter, DEFAULT_KEY_PREFIX};
pub use rules::{LimitRule, RuleSet};
