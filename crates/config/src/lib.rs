//! # buildsched-config
//!
//! Loads the process-wide host-configuration table (§3, §6): a read-only
//! map from host-type key to `{kind, machine-type, root-disk-size,
//! expected-count, ssh-username, container-image}`. No other configuration
//! enters the scheduling substrate.

pub mod error;
pub mod host;
pub mod loader;
pub mod table;

pub use error::{ConfigError, ConfigResult};
pub use host::{HostConfig, PoolKind};
pub use loader::{load_file, load_str};
pub use table::HostConfigTable;
