//! # buildsched-error
//!
//! Centralized error handling for the buildlet scheduling substrate.
//!
//! The crate exposes a single [`SchedError`] that every fallible operation in
//! the scheduler, quota queues, and pools returns. Errors carry a classified
//! [`ErrorKind`] (§7 of the design: admission-control errors, provider
//! errors, and cancellation) plus optional [`ErrorContext`] for observability.
//!
//! ```
//! use buildsched_error::{Result, SchedError};
//!
//! fn admit(host_type: &str) -> Result<()> {
//!     if host_type.is_empty() {
//!         return Err(SchedError::unknown_host_type(host_type));
//!     }
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod kinds;

pub use core::{ErrorContext, ErrorContextBuilder, Result, ResultExt, SchedError};
pub use kinds::{ErrorKind, QUOTA_EXCEEDED_RETRY_DELAY};

/// Common prelude for error handling.
pub mod prelude {
    pub use super::{ErrorContext, ErrorKind, Result, ResultExt, SchedError};
}
