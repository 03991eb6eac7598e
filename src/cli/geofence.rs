//! `geofence` commands.

use super::{OutputFormat, print_json, truncate};
use crate::models::{Coordinate, Geofence, GeofenceId, GeofenceKind, GroupId};
use crate::services::Tracker;
use crate::{Error, Result};

/// Fields of a new geofence.
#[derive(Debug, Clone)]
pub struct NewGeofenceArgs {
    /// Owning group.
    pub group: GroupId,
    /// Display name.
    pub name: String,
    /// Center latitude.
    pub latitude: f64,
    /// Center longitude.
    pub longitude: f64,
    /// Radius in meters.
    pub radius_m: u32,
    /// Policy kind name (`safe`, `restricted`, `notify`).
    pub kind: String,
    /// Explicit identifier; generated when absent.
    pub id: Option<String>,
    /// Creating member.
    pub created_by: Option<String>,
}

/// Changes to an existing geofence; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct GeofenceUpdate {
    /// New name.
    pub name: Option<String>,
    /// New center latitude.
    pub latitude: Option<f64>,
    /// New center longitude.
    pub longitude: Option<f64>,
    /// New radius.
    pub radius_m: Option<u32>,
    /// New kind name.
    pub kind: Option<String>,
}

fn parse_kind(kind: &str) -> Result<GeofenceKind> {
    GeofenceKind::parse(kind).ok_or_else(|| {
        Error::InvalidInput(format!(
            "unknown geofence kind '{kind}' (expected safe, restricted or notify)"
        ))
    })
}

/// Creates a geofence.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for invalid fields, or a storage error.
pub async fn cmd_geofence_add(tracker: &Tracker, args: NewGeofenceArgs) -> Result<Geofence> {
    let kind = parse_kind(&args.kind)?;
    let mut geofence = Geofence::new(
        args.group,
        args.name,
        Coordinate::new(args.latitude, args.longitude),
        args.radius_m,
        kind,
    );
    if let Some(id) = args.id {
        geofence = geofence.with_id(id);
    }
    if let Some(created_by) = args.created_by {
        geofence = geofence.with_created_by(created_by);
    }

    let stored = tracker.index().upsert_geofence(geofence).await?;
    println!("Created geofence {} ({})", stored.id, stored.name);
    Ok(stored)
}

/// Updates fields of an existing geofence.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the geofence is unknown or the result
/// is invalid, or a storage error.
pub async fn cmd_geofence_update(
    tracker: &Tracker,
    id: &GeofenceId,
    update: GeofenceUpdate,
) -> Result<Geofence> {
    let mut geofence = tracker
        .index()
        .find_geofence(id)
        .await?
        .ok_or_else(|| Error::InvalidInput(format!("unknown geofence '{id}'")))?;

    if let Some(name) = update.name {
        geofence.name = name;
    }
    if let Some(latitude) = update.latitude {
        geofence.center.latitude = latitude;
    }
    if let Some(longitude) = update.longitude {
        geofence.center.longitude = longitude;
    }
    if let Some(radius_m) = update.radius_m {
        geofence.radius_m = radius_m;
    }
    if let Some(kind) = update.kind {
        geofence.kind = parse_kind(&kind)?;
    }

    let stored = tracker.index().upsert_geofence(geofence).await?;
    println!("Updated geofence {} ({})", stored.id, stored.name);
    Ok(stored)
}

/// Activates or deactivates a geofence.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if the geofence is unknown, or a storage
/// error.
pub async fn cmd_geofence_set_active(
    tracker: &Tracker,
    id: &GeofenceId,
    active: bool,
) -> Result<Geofence> {
    let geofence = tracker.index().set_active(id, active).await?;
    let state = if active { "Activated" } else { "Deactivated" };
    println!("{state} geofence {} ({})", geofence.id, geofence.name);
    Ok(geofence)
}

/// Lists every geofence of a group.
///
/// # Errors
///
/// Returns a storage or serialization error.
pub async fn cmd_geofence_list(
    tracker: &Tracker,
    group: &GroupId,
    format: OutputFormat,
) -> Result<Vec<Geofence>> {
    let fences = tracker.index().list_geofences(group).await?;
    match format {
        OutputFormat::Json => print_json(&fences, "serialize_geofences")?,
        OutputFormat::Table => {
            if fences.is_empty() {
                println!("No geofences in group '{group}'.");
                return Ok(fences);
            }
            println!(
                "{:<38} {:<20} {:<10} {:>10} {:>11} {:>8} {:<7}",
                "ID", "NAME", "KIND", "LAT", "LON", "RADIUS", "ACTIVE"
            );
            println!("{}", "-".repeat(110));
            for fence in &fences {
                println!(
                    "{:<38} {:<20} {:<10} {:>10.5} {:>11.5} {:>7}m {:<7}",
                    truncate(fence.id.as_str(), 38),
                    truncate(&fence.name, 20),
                    fence.kind.as_str(),
                    fence.center.latitude,
                    fence.center.longitude,
                    fence.radius_m,
                    if fence.active { "yes" } else { "no" },
                );
            }
            println!("Total: {} geofence(s)", fences.len());
        },
    }
    Ok(fences)
}
