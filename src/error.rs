//! Error types for the ratewindow crate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for ratewindow operations.
#[derive(Error, Debug)]
pub enum RateWindowError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected before the store was touched
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The atomic batch against the backing store failed
    #[error("Store transaction failed: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ratewindow operations.
pub type Result<T> = std::result::Result<T, RateWindowError>;
