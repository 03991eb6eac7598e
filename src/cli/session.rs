//! `session` command.

use super::{OutputFormat, format_optional, print_json, truncate};
use crate::Result;
use crate::models::{GroupId, LiveSession, SessionKey, UserId};
use crate::services::Tracker;
use chrono::{DateTime, Utc};

/// Prints the live sessions of a group, or of one user in it.
///
/// Sessions are ordered by last update, newest first. The `AGE` column is
/// the staleness relative to `now`.
///
/// # Errors
///
/// Returns a storage or serialization error.
pub async fn cmd_session(
    tracker: &Tracker,
    group: &GroupId,
    user: Option<&UserId>,
    now: DateTime<Utc>,
    format: OutputFormat,
) -> Result<Vec<LiveSession>> {
    let sessions = match user {
        Some(user) => tracker
            .sessions()
            .snapshot(&SessionKey::new(user.clone(), group.clone()))
            .await?
            .into_iter()
            .collect(),
        None => tracker.sessions().sessions_for_group(group).await?,
    };

    match format {
        OutputFormat::Json => print_json(&sessions, "serialize_sessions")?,
        OutputFormat::Table => {
            if sessions.is_empty() {
                println!("No sessions for group '{group}'.");
                return Ok(sessions);
            }
            println!(
                "{:<12} {:<9} {:>11} {:>11} {:>7} {:>6} {:>8}",
                "USER", "STATUS", "LAT", "LON", "SPEED", "BATT", "AGE"
            );
            println!("{}", "-".repeat(70));
            for session in &sessions {
                let age = session.staleness(now).num_seconds().max(0);
                println!(
                    "{:<12} {:<9} {:>11} {:>11} {:>7} {:>6} {:>7}s",
                    truncate(session.user_id.as_str(), 12),
                    session.status.as_str(),
                    format_optional(session.position.map(|p| p.latitude), 5),
                    format_optional(session.position.map(|p| p.longitude), 5),
                    format_optional(session.speed, 1),
                    format_optional(session.battery_level, 0),
                    age,
                );
            }
        },
    }
    Ok(sessions)
}
