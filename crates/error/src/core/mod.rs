//! Core error types and structures.
//!
//! - [`error`] - the main [`SchedError`] struct
//! - [`result`] - `Result` alias and extension traits
//! - [`traits`] - classification/retry traits implemented by [`crate::kinds::ErrorKind`]
//! - [`context`] - structured, lazily-allocated error context

pub mod context;
pub mod error;
pub mod result;
pub mod traits;

pub use context::{ErrorContext, ErrorContextBuilder};
pub use error::SchedError;
pub use result::{Result, ResultExt};
pub use traits::{ErrorClassification, ErrorCode, RetryableError};
