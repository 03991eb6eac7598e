//! CLI command implementations.
//!
//! This module provides the command-line interface for geowatch. Each
//! submodule implements a family of commands; argument parsing lives in the
//! binary.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `serve` | Ingest NDJSON samples from stdin until EOF or ctrl-c |
//! | `replay` | Ingest an NDJSON file in order and print a summary |
//! | `feed` | Show the activity feed of a user or group |
//! | `session` | Show live sessions of a group |
//! | `geofence` | Create, update, (de)activate and list geofences |
//!
//! # Example Usage
//!
//! ```bash
//! # Create a geofence
//! geowatch geofence add --group fam --name Home --lat 28.6139 --lon 77.2090 --radius 150
//!
//! # Replay recorded samples
//! geowatch replay samples.ndjson
//!
//! # Show the last 20 events of a group
//! geowatch feed --group fam --limit 20
//! ```

// CLI commands are allowed to use println! for output
#![allow(clippy::print_stdout)]

mod feed;
mod geofence;
mod ingest;
mod session;

pub use feed::{FeedTarget, cmd_feed};
pub use geofence::{
    GeofenceUpdate, NewGeofenceArgs, cmd_geofence_add, cmd_geofence_list, cmd_geofence_set_active,
    cmd_geofence_update,
};
pub use ingest::{ReplaySummary, cmd_replay, cmd_serve, parse_sample_line};
pub use session::cmd_session;

use crate::{Error, Result};
use serde::Serialize;

/// Output format of listing commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Aligned columns.
    #[default]
    Table,
    /// Pretty-printed JSON.
    Json,
}

impl OutputFormat {
    /// Parses a format name; unknown names fall back to table.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Table,
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T, operation: &str) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| Error::OperationFailed {
        operation: operation.to_string(),
        cause: e.to_string(),
    })?;
    println!("{json}");
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn format_optional(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.precision$}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("Home", 10), "Home");
        assert_eq!(truncate("Grandparents' house", 10), "Grandpa...");
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("yaml"), OutputFormat::Table);
    }

    #[test]
    fn test_format_optional() {
        assert_eq!(format_optional(Some(12.345), 1), "12.3");
        assert_eq!(format_optional(None, 1), "-");
    }
}
