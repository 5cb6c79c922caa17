//! Main [`SchedError`] struct.

use std::fmt;
use std::time::Duration;

use crate::core::context::ErrorContext;
use crate::core::traits::{ErrorClassification, ErrorCode, RetryableError};
use crate::kinds::{CallerError, ErrorKind, ProviderError};

/// The error type returned by every fallible operation in the scheduling
/// substrate.
#[derive(Debug, Clone)]
pub struct SchedError {
    /// The classified kind of failure.
    pub kind: ErrorKind,
    /// Optional observability context.
    pub context: Option<ErrorContext>,
}

impl SchedError {
    /// Wrap a kind with no context.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    /// Attach context to this error, replacing any existing context.
    #[must_use]
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Whether the operation that produced this error should be retried
    /// locally.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Suggested delay before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.kind.retry_delay()
    }

    /// Stable machine-readable error code.
    pub fn error_code(&self) -> &'static str {
        self.kind.error_code()
    }

    /// `true` if the request itself was invalid.
    pub fn is_caller_error(&self) -> bool {
        self.kind.is_caller_error()
    }

    /// `true` if the cloud provider or reverse transport failed.
    pub fn is_provider_error(&self) -> bool {
        self.kind.is_provider_error()
    }

    /// `true` if this is a context-cancellation error.
    pub fn is_cancelled(&self) -> bool {
        self.kind.is_cancelled()
    }

    // ---- convenience constructors, mirroring §7 error kinds ----

    /// `UnknownHostType`.
    pub fn unknown_host_type(host_type: impl Into<String>) -> Self {
        Self::new(ErrorKind::Caller(CallerError::UnknownHostType {
            host_type: host_type.into(),
        }))
    }

    /// `PoolDisabled`.
    pub fn pool_disabled(host_type: impl Into<String>) -> Self {
        Self::new(ErrorKind::Caller(CallerError::PoolDisabled {
            host_type: host_type.into(),
        }))
    }

    /// `DoubleReservation`.
    pub fn double_reservation(name: impl Into<String>) -> Self {
        Self::new(ErrorKind::Caller(CallerError::DoubleReservation {
            name: name.into(),
        }))
    }

    /// `ProviderQuotaExceeded`.
    pub fn quota_exceeded(resource: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider(ProviderError::QuotaExceeded {
            resource: resource.into(),
        }))
    }

    /// `ProviderTransient`.
    pub fn provider_transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider(ProviderError::Transient {
            operation: operation.into(),
            message: message.into(),
        }))
    }

    /// `ReverseWorkerGone`.
    pub fn reverse_worker_gone(host_type: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider(ProviderError::ReverseWorkerGone {
            host_type: host_type.into(),
        }))
    }

    /// `Cancelled`.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Catch-all for errors outside the classified kinds (config parsing, I/O).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal {
            message: message.into(),
        })
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(context) = &self.context {
            write!(f, ": {context}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SchedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for SchedError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<CallerError> for SchedError {
    fn from(e: CallerError) -> Self {
        Self::new(ErrorKind::Caller(e))
    }
}

impl From<ProviderError> for SchedError {
    fn from(e: ProviderError) -> Self {
        Self::new(ErrorKind::Provider(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = SchedError::unknown_host_type("bogus")
            .with_context(ErrorContext::new("scheduler acquire"));
        let rendered = format!("{err}");
        assert!(rendered.contains("bogus"));
        assert!(rendered.contains("scheduler acquire"));
    }

    #[test]
    fn quota_exceeded_carries_retry_delay() {
        let err = SchedError::quota_exceeded("C2_CPUs");
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn cancelled_has_stable_code() {
        let err = SchedError::cancelled();
        assert!(err.is_cancelled());
        assert_eq!(err.error_code(), "CANCELLED");
    }
}
