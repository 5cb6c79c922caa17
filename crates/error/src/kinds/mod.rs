//! Error kind definitions organized by category.
//!
//! - [`caller`] — the request itself is invalid (unknown host type, etc.)
//! - [`provider`] — the cloud provider or reverse transport failed
//!
//! Cancellation is modeled as its own top-level variant rather than folded
//! into either category: it is neither the caller's fault nor the
//! provider's, and every `Acquire` path must treat it uniformly (§5, §7).

pub mod caller;
pub mod provider;

use std::time::Duration;
use thiserror::Error;

pub use caller::CallerError;
pub use provider::{ProviderError, QUOTA_EXCEEDED_RETRY_DELAY};

use crate::core::traits::{ErrorClassification, ErrorCode, RetryableError};

/// The classified kind of a [`crate::SchedError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was invalid; see [`CallerError`].
    #[error(transparent)]
    Caller(#[from] CallerError),

    /// The provider or transport failed; see [`ProviderError`].
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The caller's context was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// Catch-all for errors that cross the scheduler's boundary from
    /// infrastructure this crate doesn't model in detail (config parsing,
    /// I/O). Kept deliberately small — most failures should be classified
    /// as `Caller` or `Provider`.
    #[error("{message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl ErrorClassification for ErrorKind {
    fn is_caller_error(&self) -> bool {
        matches!(self, Self::Caller(_))
    }

    fn is_provider_error(&self) -> bool {
        matches!(self, Self::Provider(_))
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl RetryableError for ErrorKind {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Caller(e) => e.is_retryable(),
            Self::Provider(e) => e.is_retryable(),
            Self::Cancelled | Self::Internal { .. } => false,
        }
    }

    fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Provider(e) => e.retry_delay(),
            _ => None,
        }
    }
}

impl ErrorCode for ErrorKind {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Caller(e) => e.error_code(),
            Self::Provider(e) => e.error_code(),
            Self::Cancelled => "CANCELLED",
            Self::Internal { .. } => "INTERNAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_is_retryable_with_fixed_delay() {
        let kind = ErrorKind::Provider(ProviderError::QuotaExceeded {
            resource: "instances".into(),
        });
        assert!(kind.is_retryable());
        assert_eq!(kind.retry_delay(), Some(QUOTA_EXCEEDED_RETRY_DELAY));
    }

    #[test]
    fn cancelled_is_not_retryable() {
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(ErrorKind::Cancelled.is_cancelled());
    }

    #[test]
    fn caller_errors_are_not_retryable() {
        let kind = ErrorKind::Caller(CallerError::UnknownHostType {
            host_type: "bogus".into(),
        });
        assert!(kind.is_caller_error());
        assert!(!kind.is_retryable());
    }
}
