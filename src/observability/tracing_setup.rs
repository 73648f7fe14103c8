// observability/tracing_setup.rs - Log Subscriber Setup

use std::str::FromStr;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer,
    Registry,
};

use crate::config::LogConfig;

/// Log line layout
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TracingFormat {
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event, for log shippers
    Json,
}

impl FromStr for TracingFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(TracingFormat::Pretty),
            "compact" => Ok(TracingFormat::Compact),
            "json" => Ok(TracingFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Subscriber settings
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// `EnvFilter` directive, used when `RUST_LOG` is unset
    pub filter: String,
    pub format: TracingFormat,

    /// Print the module path of each event
    pub with_target: bool,

    /// Colour output; ignored for JSON
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::from_log_config(&LogConfig::default())
    }
}

impl TracingConfig {
    /// Build from the `[log]` section; unknown formats fall back to pretty
    pub fn from_log_config(log: &LogConfig) -> Self {
        let format = log.format.parse().unwrap_or_default();
        Self {
            filter: log.filter.clone(),
            format,
            with_target: format != TracingFormat::Compact,
            with_ansi: format != TracingFormat::Json,
        }
    }
}

/// Install the global subscriber, writing to stderr
///
/// Stdout stays free for command output. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: TracingConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let base = fmt::layer()
        .with_target(config.with_target)
        .with_writer(std::io::stderr);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        TracingFormat::Pretty => base.with_ansi(config.with_ansi).boxed(),
        TracingFormat::Compact => base.compact().with_ansi(config.with_ansi).boxed(),
        TracingFormat::Json => base.json().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .try_init()?;

    tracing::debug!(filter = %config.filter, format = ?config.format, "Tracing initialized");
    Ok(())
}
