//! Observability infrastructure for Strata.
//!
//! Structured logging with consistent spans. Stage runners open a
//! [`stage_span`] so every log line emitted while a batch is in flight carries
//! the stage, table and batch id.

use std::fmt;
use std::str::FromStr;
use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::{
    EnvFilter, fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::error::Error;

static INIT: Once = Once::new();

/// Filter used when `RUST_LOG` is unset: stage summaries from the Strata
/// crates, warnings from everything else.
pub const DEFAULT_DIRECTIVE: &str = "warn,strata_core=info,strata_table=info,strata_ingest=info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, with span fields flattened in.
    Json,
    /// Multi-line human-readable output.
    #[default]
    Pretty,
    /// Single-line human-readable output.
    Compact,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(Error::InvalidInput(format!(
                "unknown log format {other:?} (expected json, pretty or compact)"
            ))),
        }
    }
}

/// Logging settings, usually embedded in the caller's configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub directive: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            directive: DEFAULT_DIRECTIVE.to_string(),
        }
    }
}

impl LoggingConfig {
    /// Default settings with `format`.
    #[must_use]
    pub fn with_format(format: LogFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at process start. `RUST_LOG` overrides `config.directive`; an
/// unparsable directive falls back to [`DEFAULT_DIRECTIVE`]. Returns true if
/// this call installed the global subscriber; later calls, or a subscriber
/// installed elsewhere, leave the existing one in place.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let mut installed = false;
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.directive))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
        let registry = tracing_subscriber::registry().with(env_filter);

        let result = match config.format {
            LogFormat::Json => registry
                .with(tracing_fmt::layer().json().flatten_event(true))
                .try_init(),
            LogFormat::Pretty => registry.with(tracing_fmt::layer().pretty()).try_init(),
            LogFormat::Compact => registry.with(tracing_fmt::layer().compact()).try_init(),
        };
        installed = result.is_ok();
    });
    installed
}

/// Creates a span for a pipeline stage invocation.
///
/// ```rust
/// use strata_core::observability::stage_span;
///
/// let span = stage_span("bronze", "orders_bronze", "0190b7a4-0000-7000-8000-000000000000");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn stage_span(stage: &str, table: &str, batch_id: &str) -> Span {
    tracing::info_span!("stage", stage = stage, table = table, batch_id = batch_id)
}

/// Wrapper that hides a value from `Debug` and `Display` output.
///
/// Used for secrets (hash salts) and raw payload fragments that must never be
/// written to logs.
#[derive(Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Redacted<T>(pub T);

impl<T> Redacted<T> {
    /// Returns the wrapped value.
    #[must_use]
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_installs_at_most_once() {
        init_logging(&LoggingConfig::with_format(LogFormat::Compact));
        assert!(!init_logging(&LoggingConfig::with_format(LogFormat::Json)));
    }

    #[test]
    fn log_format_parses_config_values() {
        assert_eq!("JSON".parse::<LogFormat>().expect("json"), LogFormat::Json);
        assert_eq!(" compact ".parse::<LogFormat>().expect("compact"), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());

        let config: LoggingConfig =
            serde_json::from_value(serde_json::json!({"format": "json"})).expect("config");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.directive, DEFAULT_DIRECTIVE);
    }

    #[test]
    fn test_stage_span_creates_span() {
        let span = stage_span("silver", "orders", "batch-1");
        let _guard = span.enter();
        tracing::info!("message in stage span");
    }

    #[test]
    fn redacted_hides_value() {
        let salt = Redacted("pepper".to_string());
        assert_eq!(format!("{salt:?}"), "[REDACTED]");
        assert_eq!(salt.to_string(), "[REDACTED]");
        assert_eq!(salt.expose(), "pepper");
    }
}
