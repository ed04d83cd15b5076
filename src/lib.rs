//! Ratewindow - Distributed Sliding-Window Rate Limiter
//!
//! This crate answers one question for any key: has it seen more than N
//! events within the trailing window D? Events live in a sorted set in a
//! shared store (Redis in production), and every check runs as a single
//! atomic purge/count/insert/expire batch, so any number of processes can
//! limit the same keys consistently.
//!
//! Store failures are returned as errors, never as "exceeded". Callers that
//! fall back to [`WindowStatus::fail_open`] on error stop limiting while the
//! store is down rather than rejecting every request.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use ratelimit::{check_and_record, WindowCounter, WindowStatus};
