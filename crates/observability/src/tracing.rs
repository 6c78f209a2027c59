//! Tracing/logging initialization.
//!
//! Queue components log state transitions as structured events (`job_id`,
//! `queue`, `worker_id`, `attempt`, ...). JSON output keeps those fields
//! machine-readable; the pretty format is for local runs.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl LogConfig {
    /// Defaults, with `SPINDLE_LOG_FORMAT` applied when it parses.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(format) = lookup("SPINDLE_LOG_FORMAT").and_then(|raw| raw.parse().ok()) {
            config.format = format;
        }
        if let Some(filter) = lookup("SPINDLE_LOG_LEVEL") {
            config.default_filter = filter;
        }
        config
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(SystemTime)
        .with_target(false);

    let _ = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_lookup_overrides_format_and_level() {
        let config = LogConfig::from_lookup(|name| match name {
            "SPINDLE_LOG_FORMAT" => Some("Pretty".into()),
            "SPINDLE_LOG_LEVEL" => Some("spindle_infra=debug".into()),
            _ => None,
        });
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.default_filter, "spindle_infra=debug");
    }

    #[test]
    fn unknown_format_keeps_default() {
        let config = LogConfig::from_lookup(|name| (name == "SPINDLE_LOG_FORMAT").then(|| "xml".into()));
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn repeated_init_is_a_no_op() {
        init(&LogConfig::default());
        init(&LogConfig::default());
    }
}
