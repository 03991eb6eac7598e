//! Geographic coordinates and great-circle distance.

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Approximate length of one degree of latitude, in meters.
pub const METERS_PER_DEGREE_LAT: f64 = 111_320.0;

/// A WGS84 latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees, `[-90, 90]`.
    pub latitude: f64,
    /// Longitude in degrees, `[-180, 180]`.
    pub longitude: f64,
}

impl Coordinate {
    /// Creates a coordinate without validating it.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Returns `true` if both components are finite and within range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Validates both components.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid component.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.latitude.is_finite() {
            return Err("latitude is not finite".to_string());
        }
        if !self.longitude.is_finite() {
            return Err("longitude is not finite".to_string());
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(format!("latitude {} out of range [-90, 90]", self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(format!(
                "longitude {} out of range [-180, 180]",
                self.longitude
            ));
        }
        Ok(())
    }

    /// Great-circle distance to `other` in meters (haversine).
    #[must_use]
    pub fn distance_m(&self, other: &Self) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// Returns the point `distance_m` meters due north (negative: south).
    ///
    /// Used to build fixtures at an exact haversine distance from a center.
    #[must_use]
    pub fn offset_north(&self, distance_m: f64) -> Self {
        let delta = (distance_m / EARTH_RADIUS_M).to_degrees();
        Self::new(self.latitude + delta, self.longitude)
    }
}
