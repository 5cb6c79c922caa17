//! Logger setup errors.

use thiserror::Error;

/// Failure while building or reloading the global subscriber.
#[derive(Error, Debug)]
pub enum LogError {
    /// The `level` filter string failed to parse.
    #[error("invalid log filter {filter:?}: {source}")]
    Filter {
        /// The filter string that failed to parse.
        filter: String,
        /// Parse failure from `tracing_subscriber::EnvFilter`.
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },

    /// Reloading the live filter failed.
    #[error("failed to reload log filter: {0}")]
    Reload(#[from] tracing_subscriber::reload::Error),

    /// A global subscriber was already installed.
    #[error("a tracing subscriber is already initialized")]
    AlreadyInitialized,
}

/// Result alias for logger setup.
pub type LogResult<T> = std::result::Result<T, LogError>;
