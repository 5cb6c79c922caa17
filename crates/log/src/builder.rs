//! Builds and installs the global [`tracing`] subscriber.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing_subscriber::{
    EnvFilter, Registry,
    filter::LevelFilter,
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
};

use crate::config::{Config, Format};
use crate::error::{LogError, LogResult};

/// Handle allowing the scheduler's admin surface to change the log filter
/// at runtime without restarting the process.
#[derive(Clone)]
pub struct ReloadHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    current: Arc<ArcSwap<String>>,
}

impl ReloadHandle {
    /// Replace the active filter.
    pub fn reload(&self, filter: &str) -> LogResult<()> {
        let new_filter = EnvFilter::try_new(filter).map_err(|source| LogError::Filter {
            filter: filter.to_string(),
            source,
        })?;
        self.filter.reload(new_filter)?;
        self.current.store(Arc::new(filter.to_string()));
        Ok(())
    }

    /// The currently active filter string.
    #[must_use]
    pub fn current(&self) -> Arc<String> {
        self.current.load_full()
    }
}

/// RAII guard returned by [`LoggerBuilder::build`]. Dropping it does not tear
/// down the global subscriber (tracing has none to offer), but keeping the
/// guard alive for the process lifetime documents the intent the way the
/// rest of the scheduler's components expect a `CloseIdle`-style handle.
#[derive(Clone)]
pub struct LoggerGuard {
    reload_handle: Option<ReloadHandle>,
}

impl LoggerGuard {
    /// The reload handle, if the configuration enabled runtime reloads.
    #[must_use]
    pub fn reload_handle(&self) -> Option<&ReloadHandle> {
        self.reload_handle.as_ref()
    }
}

/// Builder for the global subscriber.
#[derive(Debug, Clone)]
pub struct LoggerBuilder {
    config: Config,
}

impl LoggerBuilder {
    /// Start building from the given configuration.
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Parse, build, and install the global subscriber.
    ///
    /// # Errors
    /// Returns [`LogError::Filter`] if `config.level` doesn't parse, or
    /// [`LogError::AlreadyInitialized`] if a subscriber is already set.
    pub fn build(self) -> LogResult<LoggerGuard> {
        let filter = EnvFilter::try_new(&self.config.level).map_err(|source| LogError::Filter {
            filter: self.config.level.clone(),
            source,
        })?;

        let (filter, reload_handle) = if self.config.reloadable {
            let (layer, handle) = reload::Layer::new(filter);
            let current = Arc::new(ArcSwap::from_pointee(self.config.level.clone()));
            (
                Box::new(layer) as Box<dyn tracing_subscriber::layer::Layer<Registry> + Send + Sync>,
                Some(ReloadHandle {
                    filter: handle,
                    current,
                }),
            )
        } else {
            (Box::new(filter) as Box<dyn tracing_subscriber::layer::Layer<Registry> + Send + Sync>, None)
        };

        let ansi = self.config.ansi;
        let result = match self.config.format {
            Format::Pretty => Registry::default()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_ansi(ansi)
                        .with_target(true),
                )
                .try_init(),
            Format::Compact => Registry::default()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(ansi)
                        .with_target(true),
                )
                .try_init(),
            Format::Json => Registry::default()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_ansi(false))
                .try_init(),
        };

        result.map_err(|_| LogError::AlreadyInitialized)?;

        Ok(LoggerGuard { reload_handle })
    }
}

/// Install a subscriber built from [`Config::from_env`]. Convenience entry
/// point for binaries embedding the scheduler.
pub fn init() -> LogResult<LoggerGuard> {
    LoggerBuilder::from_config(Config::from_env()).build()
}

/// The maximum level compiled in when no filter is supplied at all, used by
/// callers that want a filter-less fallback subscriber in tests.
pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;
