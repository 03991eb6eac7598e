//! `feed` command.

use super::{OutputFormat, format_optional, print_json, truncate};
use crate::Result;
use crate::models::{ActivityEvent, GroupId, UserId};
use crate::services::Tracker;

/// Whose feed to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedTarget {
    /// One user across groups.
    User(UserId),
    /// Every member of a group.
    Group(GroupId),
}

/// Prints the most recent activity events, newest first.
///
/// # Errors
///
/// Returns a storage or serialization error.
pub async fn cmd_feed(
    tracker: &Tracker,
    target: &FeedTarget,
    limit: usize,
    format: OutputFormat,
) -> Result<Vec<ActivityEvent>> {
    let events = match target {
        FeedTarget::User(user) => tracker.activity().recent_for(user, limit).await?,
        FeedTarget::Group(group) => tracker.activity().recent_for_group(group, limit).await?,
    };

    match format {
        OutputFormat::Json => print_json(&events, "serialize_feed")?,
        OutputFormat::Table => {
            if events.is_empty() {
                println!("No activity recorded.");
                return Ok(events);
            }
            println!(
                "{:<25} {:<12} {:<12} {:<20} {:<16} {:>8}",
                "CREATED", "USER", "GROUP", "TYPE", "GEOFENCE", "SPEED"
            );
            println!("{}", "-".repeat(98));
            for event in &events {
                println!(
                    "{:<25} {:<12} {:<12} {:<20} {:<16} {:>8}",
                    event.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    truncate(event.user_id.as_str(), 12),
                    truncate(event.group_id.as_str(), 12),
                    event.activity_type.as_str(),
                    event
                        .geofence_id
                        .as_ref()
                        .map_or_else(|| "-".to_string(), |id| truncate(id.as_str(), 16)),
                    format_optional(event.speed, 1),
                );
            }
            println!("Total: {} event(s)", events.len());
        },
    }
    Ok(events)
}
