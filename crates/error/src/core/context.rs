//! Error context for observability.

use std::collections::HashMap;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Additional context attached to a [`super::SchedError`].
///
/// Metadata is lazily allocated so the common case (no context at all, or a
/// bare description) stays cheap — quota admission runs on every mutation of
/// every dimension, so errors on the hot path must not carry a `HashMap` by
/// default.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ErrorContext {
    /// Human-readable description of what was being attempted.
    pub description: String,
    /// Host type the operation concerned, if known.
    pub host_type: Option<String>,
    /// Extra key/value pairs (lazily allocated).
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub metadata: Option<Box<HashMap<String, String>>>,
}

impl ErrorContext {
    /// Create a new context with just a description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            host_type: None,
            metadata: None,
        }
    }

    /// Attach the host type this operation concerned.
    #[must_use]
    pub fn with_host_type(mut self, host_type: impl Into<String>) -> Self {
        self.host_type = Some(host_type.into());
        self
    }

    /// Attach an extra metadata key/value pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(|| Box::new(HashMap::new()))
            .insert(key.into(), value.into());
        self
    }

    /// Read back a metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key).map(String::as_str)
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)?;
        if let Some(host_type) = &self.host_type {
            write!(f, " (host_type: {host_type})")?;
        }
        if let Some(metadata) = &self.metadata {
            for (key, value) in metadata.iter() {
                write!(f, " [{key}: {value}]")?;
            }
        }
        Ok(())
    }
}

/// Fluent builder for [`ErrorContext`].
pub struct ErrorContextBuilder {
    context: ErrorContext,
}

impl ErrorContextBuilder {
    /// Start building a context with the given description.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            context: ErrorContext::new(description),
        }
    }

    /// Attach the host type.
    #[must_use]
    pub fn host_type(mut self, host_type: impl Into<String>) -> Self {
        self.context = self.context.with_host_type(host_type);
        self
    }

    /// Attach a metadata key/value pair.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context = self.context.with_metadata(key, value);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> ErrorContext {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_attaches_host_type_and_metadata() {
        let ctx = ErrorContextBuilder::new("reserving ledger entry")
            .host_type("linux-amd64")
            .metadata("name", "buildlet-abcd1234")
            .build();

        assert_eq!(ctx.host_type.as_deref(), Some("linux-amd64"));
        assert_eq!(ctx.get_metadata("name"), Some("buildlet-abcd1234"));
        assert!(format!("{ctx}").contains("linux-amd64"));
    }

    #[test]
    fn context_without_metadata_has_no_allocation() {
        let ctx = ErrorContext::new("plain");
        assert!(ctx.metadata.is_none());
    }
}
