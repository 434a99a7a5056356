//! Result-cache errors.

use thiserror::Error;

/// Errors raised by result cache operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("reference not found: {0}")]
    NotFound(String),

    #[error("storage: {0}")]
    Storage(String),
}
