//! Per-group geofence index with a coarse grid.
//!
//! Active geofences are loaded per group and cached for a short TTL. Each
//! cached group carries a grid keyed by `(floor(lat / cell), floor(lon / cell))`
//! so that a sample is only compared against geofences whose bounding box
//! (radius plus exit margin) covers the sample's cell. Geofences whose box
//! reaches a pole or the antimeridian go to an overflow list that is always
//! checked.
//!
//! Reads are bounded by a timeout. A failed or slow read yields
//! [`IndexLookup::Unavailable`]; the ingestor treats that as a degraded cycle
//! rather than rejecting the sample.

use super::transition::HysteresisConfig;
use crate::models::{Coordinate, EARTH_RADIUS_M, Geofence, GeofenceId, GroupId};
use crate::storage::{GeofenceBackend, StorageBulkhead};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Grid boxes spanning more cells than this go to the overflow list.
const MAX_CELLS_PER_FENCE: i64 = 10_000;

/// Latitude beyond which a bounding box is treated as touching a pole.
const POLAR_LATITUDE: f64 = 89.0;

/// Index configuration.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// How long a loaded group stays cached.
    pub cache_ttl_ms: u64,
    /// Grid cell size in degrees.
    pub cell_deg: f64,
    /// Deadline for loading a group from storage.
    pub read_timeout_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 5_000,
            cell_deg: 0.05,
            read_timeout_ms: 500,
        }
    }
}

type Cell = (i64, i64);

/// Immutable view of one group's active geofences.
#[derive(Debug)]
pub struct GroupFences {
    fences: Vec<Geofence>,
    by_id: HashMap<GeofenceId, usize>,
    grid: HashMap<Cell, Vec<usize>>,
    overflow: Vec<usize>,
    cell_deg: f64,
    loaded_at: Instant,
}

impl GroupFences {
    /// Builds the grid for a set of active geofences.
    #[must_use]
    pub fn build(mut fences: Vec<Geofence>, cell_deg: f64, hysteresis: &HysteresisConfig) -> Self {
        fences.sort_by(|a, b| a.id.cmp(&b.id));
        let cell_deg = if cell_deg.is_finite() && cell_deg > 0.0 {
            cell_deg
        } else {
            IndexConfig::default().cell_deg
        };

        let mut by_id = HashMap::with_capacity(fences.len());
        let mut grid: HashMap<Cell, Vec<usize>> = HashMap::new();
        let mut overflow = Vec::new();

        for (idx, fence) in fences.iter().enumerate() {
            by_id.insert(fence.id.clone(), idx);
            let reach_m = hysteresis.exit_threshold_m(fence.radius_m);
            match cell_range(&fence.center, reach_m, cell_deg) {
                Some(((lat_lo, lon_lo), (lat_hi, lon_hi))) => {
                    for lat in lat_lo..=lat_hi {
                        for lon in lon_lo..=lon_hi {
                            grid.entry((lat, lon)).or_default().push(idx);
                        }
                    }
                },
                None => overflow.push(idx),
            }
        }

        Self {
            fences,
            by_id,
            grid,
            overflow,
            cell_deg,
            loaded_at: Instant::now(),
        }
    }

    /// All active geofences, ordered by ID.
    #[must_use]
    pub fn all(&self) -> &[Geofence] {
        &self.fences
    }

    /// Looks up an active geofence by ID.
    #[must_use]
    pub fn get(&self, id: &GeofenceId) -> Option<&Geofence> {
        self.by_id.get(id).map(|&idx| &self.fences[idx])
    }

    /// Geofences whose box covers the point's cell, plus the overflow list,
    /// ordered by ID.
    #[must_use]
    pub fn candidates(&self, point: &Coordinate) -> Vec<&Geofence> {
        let cell = cell_of(point, self.cell_deg);
        let mut indices: Vec<usize> = self
            .grid
            .get(&cell)
            .into_iter()
            .flatten()
            .chain(self.overflow.iter())
            .copied()
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices.into_iter().map(|idx| &self.fences[idx]).collect()
    }

    /// Number of geofences in the overflow list.
    #[must_use]
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.loaded_at.elapsed() < ttl
    }
}

#[allow(clippy::cast_possible_truncation)]
fn cell_of(point: &Coordinate, cell_deg: f64) -> Cell {
    (
        (point.latitude / cell_deg).floor() as i64,
        (point.longitude / cell_deg).floor() as i64,
    )
}

/// Inclusive cell range covered by a circle of `reach_m` around `center`,
/// or `None` if the box touches a pole, crosses the antimeridian, or is too
/// large for the grid.
fn cell_range(center: &Coordinate, reach_m: f64, cell_deg: f64) -> Option<(Cell, Cell)> {
    let angular = reach_m / EARTH_RADIUS_M;
    let dlat = angular.to_degrees();
    let lat_lo = center.latitude - dlat;
    let lat_hi = center.latitude + dlat;
    if lat_lo < -POLAR_LATITUDE || lat_hi > POLAR_LATITUDE {
        return None;
    }

    // Widest longitude offset of any point within `reach_m` of the center
    let ratio = angular.sin() / center.latitude.to_radians().cos();
    if !ratio.is_finite() || ratio >= 1.0 {
        return None;
    }
    let dlon = ratio.asin().to_degrees();
    let lon_lo = center.longitude - dlon;
    let lon_hi = center.longitude + dlon;
    if lon_lo < -180.0 || lon_hi > 180.0 {
        return None;
    }

    let lo = cell_of(&Coordinate::new(lat_lo, lon_lo), cell_deg);
    let hi = cell_of(&Coordinate::new(lat_hi, lon_hi), cell_deg);
    let cells = (hi.0 - lo.0 + 1).saturating_mul(hi.1 - lo.1 + 1);
    (cells <= MAX_CELLS_PER_FENCE).then_some((lo, hi))
}

/// Result of a candidate query.
#[derive(Debug, Clone)]
pub enum IndexLookup {
    /// The group's geofences were read.
    Available {
        /// Geofences that may contain the point, ordered by ID.
        candidates: Vec<Geofence>,
        /// The group's full active set.
        fences: Arc<GroupFences>,
    },
    /// The index could not be read in time.
    Unavailable,
}

impl IndexLookup {
    /// Returns `true` for [`IndexLookup::Unavailable`].
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Cached, grid-indexed view over the geofence table.
pub struct GeofenceIndex {
    backend: Arc<dyn GeofenceBackend>,
    bulkhead: StorageBulkhead,
    config: IndexConfig,
    hysteresis: HysteresisConfig,
    cache: RwLock<HashMap<GroupId, Arc<GroupFences>>>,
    generation: AtomicU64,
}

impl GeofenceIndex {
    /// Creates an index over `backend`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn GeofenceBackend>,
        bulkhead: StorageBulkhead,
        config: IndexConfig,
        hysteresis: HysteresisConfig,
    ) -> Self {
        Self {
            backend,
            bulkhead,
            config,
            hysteresis,
            cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the group's active geofences, loading them if the cache is
    /// missing or expired.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be read within the deadline.
    pub async fn group(&self, group_id: &GroupId) -> Result<Arc<GroupFences>> {
        let ttl = Duration::from_millis(self.config.cache_ttl_ms);
        if let Some(cached) = self.cached(group_id)
            && cached.is_fresh(ttl)
        {
            metrics::counter!("geofence_index_cache_total", "result" => "hit").increment(1);
            return Ok(cached);
        }
        metrics::counter!("geofence_index_cache_total", "result" => "miss").increment(1);

        let generation = self.generation.load(Ordering::Acquire);
        let backend = Arc::clone(&self.backend);
        let group = group_id.clone();
        let fences = self
            .bulkhead
            .run_with_timeout(
                "index_read",
                Duration::from_millis(self.config.read_timeout_ms.max(1)),
                move || backend.list_active(&group),
            )
            .await?;

        let loaded = Arc::new(GroupFences::build(
            fences,
            self.config.cell_deg,
            &self.hysteresis,
        ));
        tracing::debug!(
            group_id = %group_id,
            geofences = loaded.all().len(),
            overflow = loaded.overflow_len(),
            "Loaded geofence group"
        );

        // An admin change during the load makes this copy stale already
        if self.generation.load(Ordering::Acquire) == generation {
            self.cache
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(group_id.clone(), Arc::clone(&loaded));
        }
        Ok(loaded)
    }

    /// Active geofences of a group, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be read within the deadline.
    pub async fn active_geofences_for(&self, group_id: &GroupId) -> Result<Vec<Geofence>> {
        Ok(self.group(group_id).await?.all().to_vec())
    }

    /// Candidate geofences for a point.
    ///
    /// Never fails: read errors and timeouts are logged and reported as
    /// [`IndexLookup::Unavailable`].
    pub async fn candidates(&self, group_id: &GroupId, point: &Coordinate) -> IndexLookup {
        match self.group(group_id).await {
            Ok(fences) => IndexLookup::Available {
                candidates: fences.candidates(point).into_iter().cloned().collect(),
                fences,
            },
            Err(err) => {
                metrics::counter!("geofence_index_unavailable_total").increment(1);
                tracing::warn!(
                    group_id = %group_id,
                    error = %err,
                    "Geofence index unavailable, skipping evaluation for this cycle"
                );
                IndexLookup::Unavailable
            },
        }
    }

    /// Looks up an active geofence of a group by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the group cannot be read within the deadline.
    pub async fn geofence(&self, group_id: &GroupId, id: &GeofenceId) -> Result<Option<Geofence>> {
        Ok(self.group(group_id).await?.get(id).cloned())
    }

    /// Validates and stores a geofence, then drops the group's cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for invalid fields, or a storage error.
    pub async fn upsert_geofence(&self, geofence: Geofence) -> Result<Geofence> {
        geofence.validate()?;
        let backend = Arc::clone(&self.backend);
        let stored = geofence.clone();
        self.bulkhead
            .run("upsert_geofence", move || backend.upsert(&stored))
            .await?;
        self.invalidate(&geofence.group_id);
        tracing::info!(
            geofence_id = %geofence.id,
            group_id = %geofence.group_id,
            name = %geofence.name,
            radius_m = geofence.radius_m,
            kind = %geofence.kind,
            "Stored geofence"
        );
        Ok(geofence)
    }

    /// Reads a geofence by ID from storage, bypassing the cache.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn find_geofence(&self, id: &GeofenceId) -> Result<Option<Geofence>> {
        let backend = Arc::clone(&self.backend);
        let lookup = id.clone();
        self.bulkhead
            .run("get_geofence", move || backend.get(&lookup))
            .await
    }

    /// Activates or deactivates a geofence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the geofence does not exist, or a
    /// storage error.
    pub async fn set_active(&self, id: &GeofenceId, active: bool) -> Result<Geofence> {
        let existing = self
            .find_geofence(id)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("unknown geofence '{id}'")))?;

        let backend = Arc::clone(&self.backend);
        let target = id.clone();
        self.bulkhead
            .run("set_geofence_active", move || {
                backend.set_active(&target, active)
            })
            .await?;
        self.invalidate(&existing.group_id);
        tracing::info!(geofence_id = %id, active, "Changed geofence state");

        Ok(Geofence { active, ..existing })
    }

    /// Lists every geofence of a group, active or not, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list_geofences(&self, group_id: &GroupId) -> Result<Vec<Geofence>> {
        let backend = Arc::clone(&self.backend);
        let group = group_id.clone();
        self.bulkhead
            .run("list_geofences", move || backend.list_all(&group))
            .await
    }

    /// Drops the cached copy of a group.
    pub fn invalidate(&self, group_id: &GroupId) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(group_id);
    }

    fn cached(&self, group_id: &GroupId) -> Option<Arc<GroupFences>> {
        self.cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(group_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GeofenceKind;
    use crate::storage::StorageBulkheadConfig;
    use crate::storage::sqlite::SqliteGeofenceBackend;

    fn fence(id: &str, center: Coordinate, radius_m: u32) -> Geofence {
        Geofence::new(GroupId::new("fam"), "Zone", center, radius_m, GeofenceKind::Notify)
            .with_id(id)
    }

    fn index_with(backend: Arc<dyn GeofenceBackend>, config: IndexConfig) -> GeofenceIndex {
        GeofenceIndex::new(
            backend,
            StorageBulkhead::new(StorageBulkheadConfig::default(), "test"),
            config,
            HysteresisConfig::default(),
        )
    }

    #[test]
    fn test_candidates_only_near_fences() {
        let home = fence("a-home", Coordinate::new(28.6139, 77.2090), 200);
        let far = fence("b-far", Coordinate::new(19.0760, 72.8777), 200);
        let group = GroupFences::build(
            vec![far, home.clone()],
            0.05,
            &HysteresisConfig::default(),
        );

        let near_home = home.center.offset_north(150.0);
        let ids: Vec<_> = group
            .candidates(&near_home)
            .iter()
            .map(|f| f.id.as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["a-home"]);
        assert_eq!(group.all().len(), 2);
        assert_eq!(group.all()[0].id.as_str(), "a-home");
    }

    #[test]
    fn test_fence_spanning_cell_edge_is_found_from_both_sides() {
        // Center just below a cell boundary at latitude 28.65
        let center = Coordinate::new(28.6499, 77.2);
        let f = fence("edge", center, 500);
        let group = GroupFences::build(vec![f], 0.05, &HysteresisConfig::default());

        assert_eq!(group.candidates(&center.offset_north(400.0)).len(), 1);
        assert_eq!(group.candidates(&center.offset_north(-400.0)).len(), 1);
    }

    #[test]
    fn test_polar_and_antimeridian_fences_overflow() {
        let polar = fence("polar", Coordinate::new(89.5, 0.0), 1_000);
        let dateline = fence("dateline", Coordinate::new(0.0, 179.999), 1_000);
        let group = GroupFences::build(
            vec![polar, dateline],
            0.05,
            &HysteresisConfig::default(),
        );
        assert_eq!(group.overflow_len(), 2);
        assert_eq!(group.candidates(&Coordinate::new(-45.0, -100.0)).len(), 2);
    }

    #[tokio::test]
    async fn test_cache_invalidated_by_admin_operations() {
        let backend = Arc::new(SqliteGeofenceBackend::in_memory().unwrap());
        let index = index_with(backend, IndexConfig::default());
        let group = GroupId::new("fam");

        assert!(index.active_geofences_for(&group).await.unwrap().is_empty());

        let home = fence("home", Coordinate::new(28.6139, 77.2090), 200);
        index.upsert_geofence(home.clone()).await.unwrap();
        assert_eq!(index.active_geofences_for(&group).await.unwrap(), vec![home.clone()]);

        let updated = index.set_active(&home.id, false).await.unwrap();
        assert!(!updated.active);
        assert!(index.active_geofences_for(&group).await.unwrap().is_empty());
        assert_eq!(index.list_geofences(&group).await.unwrap().len(), 1);
        assert!(index.geofence(&group, &home.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_direct_backend_writes_visible_after_ttl() {
        let backend = Arc::new(SqliteGeofenceBackend::in_memory().unwrap());
        let config = IndexConfig {
            cache_ttl_ms: 0,
            ..IndexConfig::default()
        };
        let index = index_with(Arc::clone(&backend) as Arc<dyn GeofenceBackend>, config);
        let group = GroupId::new("fam");

        assert!(index.active_geofences_for(&group).await.unwrap().is_empty());
        backend
            .upsert(&fence("home", Coordinate::new(28.6, 77.2), 200))
            .unwrap();
        assert_eq!(index.active_geofences_for(&group).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_geofence_rejected() {
        let backend = Arc::new(SqliteGeofenceBackend::in_memory().unwrap());
        let index = index_with(backend, IndexConfig::default());
        let result = index
            .upsert_geofence(fence("tiny", Coordinate::new(28.6, 77.2), 5))
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    struct SlowBackend;

    impl GeofenceBackend for SlowBackend {
        fn upsert(&self, _geofence: &Geofence) -> Result<()> {
            Ok(())
        }

        fn get(&self, _id: &GeofenceId) -> Result<Option<Geofence>> {
            Ok(None)
        }

        fn set_active(&self, _id: &GeofenceId, _active: bool) -> Result<bool> {
            Ok(false)
        }

        fn list_active(&self, _group_id: &GroupId) -> Result<Vec<Geofence>> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Vec::new())
        }

        fn list_all(&self, _group_id: &GroupId) -> Result<Vec<Geofence>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_slow_read_is_unavailable() {
        let config = IndexConfig {
            read_timeout_ms: 10,
            ..IndexConfig::default()
        };
        let index = index_with(Arc::new(SlowBackend), config);
        let lookup = index
            .candidates(&GroupId::new("fam"), &Coordinate::new(28.6, 77.2))
            .await;
        assert!(lookup.is_unavailable());
    }
}
