//! Business logic services.
//!
//! Services orchestrate storage backends and provide high-level operations.
//! [`Tracker`] wires them together:
//!
//! ```text
//! LocationSample -> IngestPipeline -> LocationIngestor
//!                                       |-- GeofenceIndex ------> geofences
//!                                       |-- TransitionEvaluator
//!                                       |-- SessionStateStore --> live_sessions
//!                                       `-- ActivityEventStore -> activity_logs
//!                                                |
//!                                                `-> AlertDispatcher -> sinks
//! HeartbeatMonitor -> SessionStateStore, ActivityEventStore
//! ```

mod activity_store;
mod geofence_index;
mod heartbeat;
mod ingestor;
mod motion;
mod pipeline;
mod session_store;
mod transition;

pub use activity_store::{ActivityEventStore, AppendOutcome, DEFAULT_FEED_LIMIT, DedupConfig};
pub use geofence_index::{GeofenceIndex, GroupFences, IndexConfig, IndexLookup};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use ingestor::{IngestConfig, IngestOutcome, LocationIngestor, TransitionRecord};
pub use motion::{MotionConfig, MotionDetectors, MotionEvaluator, MotionEvent, MotionState};
pub use pipeline::IngestPipeline;
pub use session_store::{SessionStateStore, SlotGuard, SweepReport, TrackedSession};
pub use transition::{Evaluation, HysteresisConfig, Transition, TransitionEvaluator};

use crate::alerts::{AlertDispatcher, AlertSink, HttpAlertSink, LogAlertSink, run_sink};
use crate::clock::{Clock, SystemClock};
use crate::config::GeowatchConfig;
use crate::storage::{StorageBackends, StorageBulkhead};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// The assembled tracking core.
pub struct Tracker {
    config: GeowatchConfig,
    index: Arc<GeofenceIndex>,
    sessions: Arc<SessionStateStore>,
    activity: Arc<ActivityEventStore>,
    ingestor: Arc<LocationIngestor>,
    dispatcher: AlertDispatcher,
    heartbeat: HeartbeatMonitor,
}

impl Tracker {
    /// Opens a tracker over the database in `config.data_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory or database cannot be created.
    pub fn open(config: GeowatchConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| Error::OperationFailed {
            operation: "create_data_dir".to_string(),
            cause: format!("{}: {e}", config.data_dir.display()),
        })?;
        let backends = StorageBackends::open(&config.data_dir, &config.storage.resilience)?;
        Ok(Self::with_clock(config, backends, Arc::new(SystemClock)))
    }

    /// Creates a tracker over in-memory databases.
    ///
    /// # Errors
    ///
    /// Returns an error if a database cannot be initialized.
    pub fn in_memory(config: GeowatchConfig) -> Result<Self> {
        let backends = StorageBackends::in_memory(&config.storage.resilience)?;
        Ok(Self::with_clock(config, backends, Arc::new(SystemClock)))
    }

    /// Creates a tracker from explicit backends and clock.
    #[must_use]
    pub fn with_clock(
        config: GeowatchConfig,
        backends: StorageBackends,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let bulkhead = |name| StorageBulkhead::new(config.storage.bulkhead.clone(), name);
        let dispatcher = AlertDispatcher::new(config.alerts.capacity);

        let index = Arc::new(GeofenceIndex::new(
            backends.geofences,
            bulkhead("geofences"),
            config.index,
            config.hysteresis,
        ));
        let sessions = Arc::new(SessionStateStore::new(
            backends.sessions,
            bulkhead("live_sessions"),
        ));
        let activity = Arc::new(ActivityEventStore::new(
            backends.activity,
            bulkhead("activity_logs"),
            Arc::clone(&clock),
            dispatcher.clone(),
            config.dedup,
        ));
        let ingestor = Arc::new(LocationIngestor::new(
            config.ingest,
            config.features,
            config.dedup,
            TransitionEvaluator::new(config.hysteresis),
            MotionEvaluator::new(config.motion),
            Arc::clone(&index),
            Arc::clone(&sessions),
            Arc::clone(&activity),
        ));
        let heartbeat = HeartbeatMonitor::new(
            Arc::clone(&sessions),
            Arc::clone(&activity),
            clock,
            config.heartbeat,
        );

        Self {
            config,
            index,
            sessions,
            activity,
            ingestor,
            dispatcher,
            heartbeat,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &GeowatchConfig {
        &self.config
    }

    /// Direct (unqueued) ingestion.
    #[must_use]
    pub const fn ingestor(&self) -> &Arc<LocationIngestor> {
        &self.ingestor
    }

    /// Geofence index and administration.
    #[must_use]
    pub const fn index(&self) -> &Arc<GeofenceIndex> {
        &self.index
    }

    /// Live sessions.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionStateStore> {
        &self.sessions
    }

    /// Activity log.
    #[must_use]
    pub const fn activity(&self) -> &Arc<ActivityEventStore> {
        &self.activity
    }

    /// Alert dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    /// Heartbeat monitor.
    #[must_use]
    pub const fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// Starts the pipeline, heartbeat loop and configured alert sinks on the
    /// current runtime.
    #[must_use]
    pub fn start(&self) -> TrackerRuntime {
        let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
        if self.config.alerts.log {
            sinks.push(Arc::new(LogAlertSink));
        }
        for endpoint in &self.config.alerts.http {
            sinks.push(Arc::new(HttpAlertSink::new(endpoint.clone())));
        }
        self.start_with_sinks(sinks)
    }

    /// Like [`Self::start`], with explicit alert sinks.
    #[must_use]
    pub fn start_with_sinks(&self, sinks: Vec<Arc<dyn AlertSink>>) -> TrackerRuntime {
        let pipeline = Arc::new(IngestPipeline::start(
            Arc::clone(&self.ingestor),
            &self.config.ingest,
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let heartbeat = self.heartbeat.clone().spawn(shutdown_rx);
        let sink_count = sinks.len();
        let sinks = sinks
            .into_iter()
            .map(|sink| {
                tokio::spawn(run_sink(
                    &self.dispatcher,
                    sink,
                    Some(Arc::clone(&self.activity)),
                ))
            })
            .collect();
        tracing::info!(sinks = sink_count, "Tracker started");

        TrackerRuntime {
            pipeline,
            dispatcher: self.dispatcher.clone(),
            shutdown,
            heartbeat,
            sinks,
        }
    }
}

/// Background tasks of a started [`Tracker`].
pub struct TrackerRuntime {
    pipeline: Arc<IngestPipeline>,
    dispatcher: AlertDispatcher,
    shutdown: watch::Sender<bool>,
    heartbeat: JoinHandle<()>,
    sinks: Vec<JoinHandle<()>>,
}

impl TrackerRuntime {
    /// Queued ingestion.
    #[must_use]
    pub const fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    /// Drains queued samples, stops the heartbeat, then lets the alert sinks
    /// finish the events already published.
    pub async fn shutdown(self) {
        self.pipeline.shutdown().await;
        let _ = self.shutdown.send(true);
        if let Err(err) = self.heartbeat.await {
            tracing::error!(error = %err, "Heartbeat task panicked");
        }
        self.dispatcher.close();
        for sink in self.sinks {
            if let Err(err) = sink.await {
                tracing::error!(error = %err, "Alert sink task panicked");
            }
        }
        tracing::info!("Tracker stopped");
    }
}
