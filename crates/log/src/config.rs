//! Logger configuration and environment-driven presets.

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Human-readable, multi-line, colorized — local development.
    Pretty,
    /// Single-line key=value — container logs piped to a collector.
    #[default]
    Compact,
    /// Structured JSON — production, machine-parsed.
    Json,
}

/// Logger configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// `tracing_subscriber::EnvFilter` directive string, e.g. `"info,buildsched_core=debug"`.
    pub level: String,
    /// Output encoding.
    pub format: Format,
    /// Whether the filter can be changed at runtime via [`crate::ReloadHandle`].
    pub reloadable: bool,
    /// ANSI color codes in `Pretty`/`Compact` output.
    pub ansi: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Compact,
            reloadable: false,
            ansi: true,
        }
    }
}

impl Config {
    /// Read configuration from `BUILDSCHED_LOG`/`RUST_LOG` and
    /// `BUILDSCHED_LOG_FORMAT`, falling back to [`Config::default`].
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("BUILDSCHED_LOG") {
            config.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            config.level = level;
        }

        if let Ok(format) = std::env::var("BUILDSCHED_LOG_FORMAT") {
            config.format = match format.to_lowercase().as_str() {
                "pretty" => Format::Pretty,
                "json" => Format::Json,
                _ => Format::Compact,
            };
        }

        config
    }

    /// Pretty, colorized, debug-level — for running the scheduler locally.
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            format: Format::Pretty,
            reloadable: true,
            ansi: true,
        }
    }

    /// JSON, info-level, no color — for the coordinator's production deployment.
    #[must_use]
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            format: Format::Json,
            reloadable: true,
            ansi: false,
        }
    }
}
