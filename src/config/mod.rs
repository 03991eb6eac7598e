//! Configuration management.
//!
//! Configuration is read from TOML, then overridden by `GEOWATCH_*`
//! environment variables (a `.env` file in the working directory is loaded
//! first). Every section is optional.
//!
//! ```toml
//! data_dir = "/var/lib/geowatch"
//!
//! [hysteresis]
//! min_margin_m = 5.0
//! margin_ratio = 0.05
//!
//! [heartbeat]
//! timeout_s = 120
//!
//! [[alerts.http]]
//! name = "dashboard"
//! url = "https://dashboard.example/hooks/geowatch"
//! ```

mod features;

pub use features::FeatureFlags;

use crate::alerts::AlertsConfig;
use crate::observability::{LogFormat, LoggingConfig, MetricsConfig};
use crate::services::{
    DedupConfig, HeartbeatConfig, HysteresisConfig, IndexConfig, IngestConfig, MotionConfig,
};
use crate::storage::{StorageBulkheadConfig, StorageResilienceConfig};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "GEOWATCH_CONFIG_PATH";

/// Storage section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Retry and circuit breaker settings.
    pub resilience: StorageResilienceConfig,
    /// Concurrency and timeout settings.
    pub bulkhead: StorageBulkheadConfig,
}

/// Main configuration for geowatch.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeowatchConfig {
    /// Directory holding the database.
    pub data_dir: PathBuf,
    /// Boundary hysteresis.
    pub hysteresis: HysteresisConfig,
    /// Session liveness.
    pub heartbeat: HeartbeatConfig,
    /// Ingestion and pipeline.
    pub ingest: IngestConfig,
    /// Activity log idempotency.
    pub dedup: DedupConfig,
    /// Geofence index cache and grid.
    pub index: IndexConfig,
    /// Storage resilience.
    pub storage: StorageConfig,
    /// Motion thresholds.
    pub motion: MotionConfig,
    /// Optional event kinds.
    pub features: FeatureFlags,
    /// Logging.
    pub logging: LoggingConfig,
    /// Prometheus metrics.
    pub metrics: MetricsConfig,
    /// Alert sinks.
    pub alerts: AlertsConfig,
}

impl Default for GeowatchConfig {
    fn default() -> Self {
        Self {
            data_dir: crate::storage::default_data_dir(),
            hysteresis: HysteresisConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            ingest: IngestConfig::default(),
            dedup: DedupConfig::default(),
            index: IndexConfig::default(),
            storage: StorageConfig::default(),
            motion: MotionConfig::default(),
            features: FeatureFlags::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

impl GeowatchConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the text is not valid configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::InvalidInput(format!("config: {e}")))
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::OperationFailed {
            operation: "read_config_file".to_string(),
            cause: format!("{}: {e}", path.display()),
        })?;
        Self::from_toml(&contents)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the following paths in order:
    /// 1. Platform-specific config dir (`~/Library/Application Support/geowatch/` on macOS)
    /// 2. XDG config dir (`~/.config/geowatch/` for Unix compatibility)
    ///
    /// Returns default configuration if no config file is found. Unreadable
    /// files are logged and skipped.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let candidates = [
            base_dirs.config_dir().join("geowatch").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("geowatch")
                .join("config.toml"),
        ];
        for path in candidates.iter().filter(|path| path.exists()) {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "Ignoring config file");
                },
            }
        }

        Self::default()
    }

    /// Loads configuration for the CLI.
    ///
    /// Uses `explicit`, else `GEOWATCH_CONFIG_PATH`, else the default
    /// locations, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be loaded.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let from_env = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let config = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::load_default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Applies `GEOWATCH_*` environment overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("GEOWATCH_DATA_DIR")
            && !dir.is_empty()
        {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_env("GEOWATCH_HYSTERESIS_MIN_MARGIN_M") {
            self.hysteresis.min_margin_m = v;
        }
        if let Some(v) = parse_env("GEOWATCH_HYSTERESIS_MARGIN_RATIO") {
            self.hysteresis.margin_ratio = v;
        }
        if let Some(v) = parse_env("GEOWATCH_HEARTBEAT_TIMEOUT_S") {
            self.heartbeat.timeout_s = v;
        }
        if let Some(v) = parse_env("GEOWATCH_HEARTBEAT_SWEEP_INTERVAL_S") {
            self.heartbeat.sweep_interval_s = v;
        }
        if let Some(v) = parse_env("GEOWATCH_INGEST_WORKERS") {
            self.ingest.workers = v;
        }
        if let Some(v) = parse_env("GEOWATCH_INGEST_QUEUE_CAPACITY") {
            self.ingest.queue_capacity = v;
        }
        if let Some(v) = parse_env::<u64>("GEOWATCH_LOCATION_UPDATE_INTERVAL_S") {
            self.ingest.location_update_interval_s = (v > 0).then_some(v);
        }
        if let Some(v) = parse_env("GEOWATCH_DEDUP_TRANSITION_BUCKET_MS") {
            self.dedup.transition_bucket_ms = v;
        }
        if let Some(v) = parse_env("GEOWATCH_INDEX_CACHE_TTL_MS") {
            self.index.cache_ttl_ms = v;
        }
        if let Some(v) = parse_env("GEOWATCH_SPEED_LIMIT_KMH") {
            self.motion.speed_limit_kmh = v;
        }
        if let Some(v) = parse_bool_env("GEOWATCH_FEATURE_SPEED_ALERTS") {
            self.features.speed_alerts = v;
        }
        if let Some(v) = parse_bool_env("GEOWATCH_FEATURE_HARSH_DRIVING") {
            self.features.harsh_driving = v;
        }
        if let Some(v) = parse_bool_env("GEOWATCH_FEATURE_LOCATION_UPDATES") {
            self.features.location_updates = v;
        }
        if let Ok(format) = std::env::var("GEOWATCH_LOG_FORMAT") {
            self.logging.format = LogFormat::parse(&format);
        }
        if let Ok(filter) = std::env::var("GEOWATCH_LOG_FILTER")
            && !filter.is_empty()
        {
            self.logging.filter = filter;
        }
        if let Some(v) = parse_bool_env("GEOWATCH_METRICS_ENABLED") {
            self.metrics.enabled = v;
        }
        if let Some(v) = parse_env("GEOWATCH_METRICS_PORT") {
            self.metrics.port = v;
        }
        self.storage.resilience = self.storage.resilience.with_env_overrides();
        self.storage.bulkhead = self.storage.bulkhead.with_env_overrides();
        self
    }

    /// Sets the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Sets the feature flags.
    #[must_use]
    pub const fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_bool_env(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|value| {
        let value = value.to_lowercase();
        value == "true" || value == "1" || value == "yes"
    })
}
