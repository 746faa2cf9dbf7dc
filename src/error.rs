//! Error types for QuotaGuard.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for QuotaGuard operations.
///
/// Note that exceeding a limit is never an error: it is the `allowed == false`
/// branch of a [`Decision`](crate::ratelimit::Decision).
#[derive(Error, Debug)]
pub enum QuotaGuardError {
    /// Invalid limiter parameters or rules, raised at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store failures surfaced from administrative operations
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Layered settings could not be loaded
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for QuotaGuard operations.
pub type Result<T> = std::result::Result<T, QuotaGuardError>;
