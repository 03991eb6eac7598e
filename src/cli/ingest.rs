//! `serve` and `replay` commands.

use crate::models::LocationSample;
use crate::services::{IngestOutcome, Tracker};
use crate::{Error, Result};
use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

/// Parses one NDJSON line into a sample.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the line is not a sample object.
pub fn parse_sample_line(line: &str) -> Result<LocationSample> {
    serde_json::from_str(line).map_err(|e| Error::InvalidInput(format!("malformed sample: {e}")))
}

/// Counts of a replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    /// Lines read, excluding blank lines.
    pub lines: usize,
    /// Lines that were not valid sample JSON.
    pub malformed: usize,
    /// Samples accepted with a healthy index.
    pub accepted: usize,
    /// Samples accepted while the index was unavailable.
    pub degraded: usize,
    /// Samples not newer than the last accepted one.
    pub stale: usize,
    /// Samples failing validation.
    pub rejected: usize,
    /// Samples whose processing failed.
    pub failed: usize,
    /// Geofence transitions detected.
    pub transitions: usize,
    /// Activity events newly written.
    pub events: usize,
}

impl ReplaySummary {
    fn record(&mut self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Accepted {
                transitions,
                events,
                index_degraded,
            } => {
                if *index_degraded {
                    self.degraded += 1;
                } else {
                    self.accepted += 1;
                }
                self.transitions += transitions.len();
                self.events += events;
            },
            IngestOutcome::Stale => self.stale += 1,
            IngestOutcome::Rejected(_) => self.rejected += 1,
        }
    }
}

/// Ingests an NDJSON file line by line, in file order.
///
/// Replaying the same file twice writes no new events.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn cmd_replay(tracker: &Tracker, path: &Path) -> Result<ReplaySummary> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::OperationFailed {
            operation: "open_replay_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
    let summary = replay_lines(tracker, BufReader::new(file)).await?;
    tracing::info!(
        path = %path.display(),
        lines = summary.lines,
        events = summary.events,
        "Replay complete"
    );
    Ok(summary)
}

async fn replay_lines<R>(tracker: &Tracker, reader: R) -> Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = ReplaySummary::default();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.map_err(read_error)? {
        if line.trim().is_empty() {
            continue;
        }
        summary.lines += 1;
        let sample = match parse_sample_line(&line) {
            Ok(sample) => sample,
            Err(err) => {
                tracing::warn!(line = summary.lines, error = %err, "Skipping malformed line");
                summary.malformed += 1;
                continue;
            },
        };
        match tracker.ingestor().ingest(sample).await {
            Ok(outcome) => summary.record(&outcome),
            Err(err) => {
                tracing::error!(line = summary.lines, error = %err, "Failed to ingest sample");
                summary.failed += 1;
            },
        }
    }
    Ok(summary)
}

/// Ingests NDJSON samples from `input` through the pipeline until EOF or
/// ctrl-c, then drains the pipeline and stops the background tasks.
///
/// Returns the number of samples queued.
///
/// # Errors
///
/// Returns an error if `input` cannot be read.
pub async fn cmd_serve<R>(tracker: &Tracker, input: R) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let runtime = tracker.start();
    let mut lines = input.lines();
    let mut queued = 0usize;

    let result = loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, draining pipeline");
                break Ok(());
            }
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(err) => break Err(read_error(err)),
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_sample_line(&line) {
            Ok(sample) => {
                if let Err(err) = runtime.pipeline().enqueue(sample).await {
                    break Err(err);
                }
                queued += 1;
            },
            Err(err) => {
                metrics::counter!("ingest_samples_total", "outcome" => "malformed").increment(1);
                tracing::warn!(error = %err, "Skipping malformed line");
            },
        }
    };

    runtime.shutdown().await;
    result.map(|()| queued)
}

#[allow(clippy::needless_pass_by_value)]
fn read_error(e: std::io::Error) -> Error {
    Error::OperationFailed {
        operation: "read_samples".to_string(),
        cause: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeowatchConfig;
    use crate::models::{Coordinate, Geofence, GeofenceKind, GroupId, UserId};

    fn tracker() -> Tracker {
        Tracker::in_memory(GeowatchConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_sample_line() {
        let sample = parse_sample_line(
            r#"{"user_id":"alice","group_id":"fam","latitude":28.6,"longitude":77.2,"speed":12.5,"timestamp":"2024-05-01T08:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(sample.user_id, UserId::new("alice"));
        assert_eq!(sample.speed, Some(12.5));
        assert!(sample.battery.is_none());

        assert!(parse_sample_line("{\"user_id\":\"alice\"}").is_err());
        assert!(parse_sample_line("not json").is_err());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let tracker = tracker();
        let home = Coordinate::new(28.6139, 77.2090);
        tracker
            .index()
            .upsert_geofence(
                Geofence::new(GroupId::new("fam"), "Home", home, 100, GeofenceKind::Safe)
                    .with_id("home"),
            )
            .await
            .unwrap();

        let inside = home.offset_north(20.0);
        let outside = home.offset_north(300.0);
        let input = format!(
            "{}\n\nnot json\n{}\n{}\n",
            line(inside, "08:00:00"),
            line(outside, "08:01:00"),
            line(inside, "08:00:30"),
        );

        let first = replay_lines(&tracker, input.as_bytes()).await.unwrap();
        assert_eq!(first.lines, 4);
        assert_eq!(first.malformed, 1);
        assert_eq!(first.accepted, 2);
        assert_eq!(first.stale, 1);
        assert_eq!(first.transitions, 2);

        let second = replay_lines(&tracker, input.as_bytes()).await.unwrap();
        assert_eq!(second.stale, 3);
        assert_eq!(second.events, 0);
        assert_eq!(tracker.activity().count().await.unwrap(), first.events);
    }

    fn line(at: Coordinate, time: &str) -> String {
        format!(
            r#"{{"user_id":"alice","group_id":"fam","latitude":{},"longitude":{},"timestamp":"2024-05-01T{time}Z"}}"#,
            at.latitude, at.longitude
        )
    }
}
