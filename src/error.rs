//! Error kinds surfaced by the classification core.
//!
//! Only [`ClassifyError::InputInvalid`], [`ClassifyError::Cancelled`], and
//! [`ClassifyError::RuleStoreError`] ever reach a caller as an `error`
//! verdict — everything else degrades the affected signal to `false` and
//! the classifier continues.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("no valid domain found in input")]
    InputInvalid,

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("DNS resolution timed out")]
    ResolveTimeout,

    #[error("rule store error: {0}")]
    RuleStoreError(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ClassifyError>;
