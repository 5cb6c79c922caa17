//! `Result` alias and context-attaching extension trait.

use crate::core::context::ErrorContext;
use crate::core::error::SchedError;

/// `Result` alias used throughout the scheduling substrate.
pub type Result<T> = std::result::Result<T, SchedError>;

/// Attach [`ErrorContext`] to a `Result`'s error without needing to match on
/// it first.
pub trait ResultExt<T> {
    /// Attach a plain description as context.
    fn context(self, description: impl Into<String>) -> Result<T>;

    /// Attach a lazily-built context.
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> ErrorContext;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, description: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(ErrorContext::new(description)))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> ErrorContext,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_attached_on_err() {
        let result: Result<()> = Err(SchedError::unknown_host_type("x")).context("acquiring");
        let err = result.unwrap_err();
        assert_eq!(err.context.unwrap().description, "acquiring");
    }

    #[test]
    fn context_is_not_evaluated_on_ok() {
        let mut called = false;
        let result: Result<()> = Ok(()).with_context(|| {
            called = true;
            ErrorContext::new("unused")
        });
        assert!(result.is_ok());
        assert!(!called);
    }
}
