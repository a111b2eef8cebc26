// observability/tracing_setup.rs - Tracing Configuration

use std::str::FromStr;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Tracing output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable format (default)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation
    Json,
}

impl FromStr for TracingFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(TracingFormat::Pretty),
            "compact" => Ok(TracingFormat::Compact),
            "json" => Ok(TracingFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Configuration for tracing
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Log level filter (e.g., "info", "fipa_contract_net=debug")
    pub filter: String,

    pub format: TracingFormat,

    /// Include span events (new, close)
    pub with_span_events: bool,

    /// Include file and line numbers
    pub with_file: bool,

    /// Include target (module path)
    pub with_target: bool,

    pub with_thread_ids: bool,

    /// ANSI colors, ignored by the JSON format
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info,fipa_contract_net=debug".into(),
            format: TracingFormat::Pretty,
            with_span_events: false,
            with_file: false,
            with_target: true,
            with_thread_ids: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// JSON, session lifecycle only
    pub fn production() -> Self {
        Self {
            filter: "info,fipa_contract_net=info".into(),
            format: TracingFormat::Json,
            with_ansi: false,
            ..Self::default()
        }
    }

    /// Pretty, every state change and timer
    pub fn development() -> Self {
        Self {
            filter: "debug,fipa_contract_net=trace".into(),
            format: TracingFormat::Pretty,
            with_span_events: true,
            with_file: true,
            with_thread_ids: true,
            ..Self::default()
        }
    }

    /// Same level for everything, including this crate
    pub fn with_level(mut self, level: &str) -> Self {
        self.filter = format!("{level},fipa_contract_net={level}");
        self
    }

    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `config.filter`.
///
/// Fails if a global subscriber is already set.
pub fn try_init_tracing(config: &TracingConfig) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids);

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.format {
        TracingFormat::Pretty => registry.with(layer.with_ansi(config.with_ansi)).try_init(),
        TracingFormat::Compact => registry
            .with(layer.compact().with_ansi(config.with_ansi))
            .try_init(),
        TracingFormat::Json => registry.with(layer.json()).try_init(),
    }
}

/// Initialize the tracing subscriber, once at application startup
pub fn init_tracing(config: TracingConfig) {
    match try_init_tracing(&config) {
        Ok(()) => tracing::info!(
            filter = %config.filter,
            format = ?config.format,
            "Tracing initialized"
        ),
        Err(e) => tracing::warn!(error = %e, "Tracing already initialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config_default() {
        let config = TracingConfig::default();
        assert!(config.filter.contains("fipa_contract_net"));
        assert!(config.with_ansi);
    }

    #[test]
    fn test_tracing_config_production() {
        let config = TracingConfig::production();
        assert_eq!(config.format, TracingFormat::Json);
        assert!(!config.with_ansi);
        assert!(config.with_target);
    }

    #[test]
    fn test_level_and_format_parsing() {
        let config = TracingConfig::default()
            .with_level("warn")
            .with_format("COMPACT".parse().unwrap());
        assert_eq!(config.filter, "warn,fipa_contract_net=warn");
        assert_eq!(config.format, TracingFormat::Compact);
        assert!("yaml".parse::<TracingFormat>().is_err());
    }
}
