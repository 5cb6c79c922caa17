//! Errors caused by the caller, not by contention for capacity.

use std::time::Duration;
use thiserror::Error;

use crate::core::traits::{ErrorCode, RetryableError};

/// Errors attributable to the request itself rather than to capacity
/// pressure or the provider. §7: "unrecoverable at this layer; surface to
/// caller" for all three variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallerError {
    /// The requested host type is not present in the host-configuration
    /// table.
    #[error("unknown host type {host_type:?}")]
    UnknownHostType {
        /// The host type key that was looked up.
        host_type: String,
    },

    /// The pool selected for this host type has been administratively
    /// disabled.
    #[error("pool for host type {host_type:?} is disabled")]
    PoolDisabled {
        /// The host type whose pool is disabled.
        host_type: String,
    },

    /// [`crate::kinds::ErrorKind`] returned by `Ledger::Reserve` when the
    /// same logical worker name is reserved twice; indicates a bug in the
    /// caller, since names are meant to be generated fresh per request.
    #[error("ledger entry {name:?} already reserved")]
    DoubleReservation {
        /// The worker name that collided.
        name: String,
    },
}

impl RetryableError for CallerError {
    fn is_retryable(&self) -> bool {
        false
    }

    fn retry_delay(&self) -> Option<Duration> {
        None
    }
}

impl ErrorCode for CallerError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownHostType { .. } => "UNKNOWN_HOST_TYPE",
            Self::PoolDisabled { .. } => "POOL_DISABLED",
            Self::DoubleReservation { .. } => "DOUBLE_RESERVATION",
        }
    }
}
