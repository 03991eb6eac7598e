//! Log output settings.

use serde::Deserialize;
use std::path::PathBuf;

/// Default `EnvFilter` directive.
pub const DEFAULT_LOG_FILTER: &str = "geowatch=info,warn";

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, multi-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses a format name; unknown names fall back to pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Append logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: DEFAULT_LOG_FILTER.to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Builds the effective filter.
    ///
    /// `verbose` raises geowatch's own level to `debug`.
    #[must_use]
    pub fn env_filter(&self, verbose: bool) -> tracing_subscriber::EnvFilter {
        if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
            return filter;
        }
        let directives = if verbose {
            format!("{},geowatch=debug", self.filter)
        } else {
            self.filter.clone()
        };
        tracing_subscriber::EnvFilter::try_new(&directives).unwrap_or_else(|err| {
            eprintln!("Invalid log filter '{directives}': {err}");
            tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
        })
    }
}
