//! # buildsched-log
//!
//! Thin [`tracing`]-subscriber setup shared by the scheduler binary and its
//! tests. Every component in `buildsched-core` logs through `tracing`
//! directly (spans for `Acquire`, events for admission/grant/release); this
//! crate only owns turning a [`Config`] into an installed global subscriber.

pub mod builder;
pub mod config;
pub mod error;

pub use builder::{LoggerBuilder, LoggerGuard, ReloadHandle, init};
pub use config::{Config, Format};
pub use error::{LogError, LogResult};
