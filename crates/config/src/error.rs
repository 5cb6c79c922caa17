//! Host-configuration loading errors.

use std::path::PathBuf;
use thiserror::Error;

/// Failure loading or validating the host-configuration table.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read host config file {path:?}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file did not parse as TOML.
    #[error("failed to parse host config file {path:?}: {source}")]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Underlying parse failure.
        #[source]
        source: toml::de::Error,
    },

    /// A host type entry failed validation after parsing.
    #[error("host type {host_type:?} is invalid: {message}")]
    Invalid {
        /// The offending host type key.
        host_type: String,
        /// Description of what's wrong.
        message: String,
    },
}

/// Result alias for host-configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for buildsched_error::SchedError {
    fn from(e: ConfigError) -> Self {
        buildsched_error::SchedError::internal(e.to_string())
    }
}
