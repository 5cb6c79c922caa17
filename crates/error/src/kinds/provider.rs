//! Errors originating from the cloud provider or the reverse-dial transport.

use std::time::Duration;
use thiserror::Error;

use crate::core::traits::{ErrorCode, RetryableError};

/// The fixed backoff used for `ProviderQuotaExceeded` retries (§4.3, step 7;
/// kept as a named constant per the open question in §9 — downstream
/// systems that want a cap should wrap [`crate::SchedError::retry_after`]
/// rather than this crate silently changing the default).
pub const QUOTA_EXCEEDED_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Errors surfaced by the VM provisioner, the reverse-dial transport, or the
/// reconciliation loops.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider rejected a VM-creation request because our account is
    /// over quota. Recoverable locally: the cloud's view of quota may lag
    /// our own accounting, so `CloudPool::Acquire` sleeps and retries this
    /// one until the caller's context expires.
    #[error("provider reports quota exceeded for {resource}")]
    QuotaExceeded {
        /// Name of the resource dimension the provider rejected.
        resource: String,
    },

    /// Any other provider failure: network errors, malformed responses,
    /// instance creation failures unrelated to quota. Not retried by this
    /// layer; any partially-created VM is cleaned up and the error surfaces.
    #[error("provider error during {operation}: {message}")]
    Transient {
        /// Operation being attempted (e.g. `"StartNewVM"`, `"DestroyInstances"`).
        operation: String,
        /// Provider-reported message.
        message: String,
    },

    /// A reverse-connected worker disappeared (health check failed, or it
    /// was grabbed/removed between grant and sweep). Internal: the caller
    /// of `ReversePool::Acquire` sees `Cancelled` or keeps retrying until
    /// its context expires (§4.4, step 3).
    #[error("reverse worker for host type {host_type:?} is gone")]
    ReverseWorkerGone {
        /// Host type whose worker disappeared.
        host_type: String,
    },
}

impl RetryableError for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::QuotaExceeded { .. } => Some(QUOTA_EXCEEDED_RETRY_DELAY),
            _ => None,
        }
    }
}

impl ErrorCode for ProviderError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "PROVIDER_QUOTA_EXCEEDED",
            Self::Transient { .. } => "PROVIDER_TRANSIENT",
            Self::ReverseWorkerGone { .. } => "REVERSE_WORKER_GONE",
        }
    }
}
