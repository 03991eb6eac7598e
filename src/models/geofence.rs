//! Geofence types.

use super::{Coordinate, GeofenceId, GroupId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest accepted geofence radius in meters.
pub const MIN_RADIUS_M: u32 = 10;

/// Largest accepted geofence radius in meters.
pub const MAX_RADIUS_M: u32 = 50_000;

/// Maximum geofence name length in characters.
pub const MAX_NAME_LEN: usize = 100;

/// Policy kind of a geofence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceKind {
    /// A place the member is expected to be (home, school).
    Safe,
    /// A place the member should not enter.
    Restricted,
    /// A place whose crossings are only reported.
    Notify,
}

impl GeofenceKind {
    /// Returns the storage name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe_zone",
            Self::Restricted => "restricted_zone",
            Self::Notify => "notification_zone",
        }
    }

    /// Parses a kind from either its short or storage spelling.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "safe" | "safe_zone" => Some(Self::Safe),
            "restricted" | "restricted_zone" => Some(Self::Restricted),
            "notify" | "notification" | "notification_zone" => Some(Self::Notify),
            _ => None,
        }
    }
}

impl fmt::Display for GeofenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An administrator-defined circular zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    /// Unique identifier.
    pub id: GeofenceId,
    /// Owning group.
    pub group_id: GroupId,
    /// Display name.
    pub name: String,
    /// Center of the circle.
    pub center: Coordinate,
    /// Radius in meters.
    pub radius_m: u32,
    /// Policy kind.
    pub kind: GeofenceKind,
    /// Inactive geofences are skipped during evaluation.
    pub active: bool,
    /// Member who created the geofence.
    pub created_by: String,
}

impl Geofence {
    /// Creates an active geofence with a generated identifier.
    #[must_use]
    pub fn new(
        group_id: GroupId,
        name: impl Into<String>,
        center: Coordinate,
        radius_m: u32,
        kind: GeofenceKind,
    ) -> Self {
        Self {
            id: GeofenceId::generate(),
            group_id,
            name: name.into(),
            center,
            radius_m,
            kind,
            active: true,
            created_by: String::new(),
        }
    }

    /// Sets the identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<GeofenceId>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the creator.
    #[must_use]
    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    /// Validates the administrative fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an empty or malformed name, an
    /// invalid center, or a radius outside `[10, 50000]` meters.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("geofence name is required".to_string()));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(Error::InvalidInput(format!(
                "geofence name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '\''))
        {
            return Err(Error::InvalidInput(
                "geofence name contains invalid characters".to_string(),
            ));
        }
        self.center
            .validate()
            .map_err(|reason| Error::InvalidInput(format!("geofence center: {reason}")))?;
        if !(MIN_RADIUS_M..=MAX_RADIUS_M).contains(&self.radius_m) {
            return Err(Error::InvalidInput(format!(
                "geofence radius {} must be within [{MIN_RADIUS_M}, {MAX_RADIUS_M}] meters",
                self.radius_m
            )));
        }
        Ok(())
    }
}
