//! Storage resilience wrapper with retries and circuit breaking.
//!
//! Transient storage failures are retried with bounded exponential backoff.
//! Consecutive failures open a circuit breaker so that an unhealthy database
//! is not hammered by every ingest worker at once.
//!
//! # Circuit Breaker States
//!
//! ```text
//! +--------+     failures >= threshold     +------+
//! | Closed | --------------------------->  | Open |
//! +--------+                               +------+
//!     ^                                        |
//!     |  success                               | timeout elapsed
//!     |                                        v
//!     +--------------------------------  +-----------+
//!                                        | Half-Open |
//!                                        +-----------+
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use geowatch::storage::resilience::{ResilientBackend, StorageResilienceConfig};
//! use geowatch::storage::sqlite::SqliteActivityBackend;
//!
//! let backend = SqliteActivityBackend::new(db_path)?;
//! let resilient = ResilientBackend::new(backend, StorageResilienceConfig::default(), "activity");
//!
//! // Appends are now retried and protected by the circuit breaker
//! resilient.append(&event)?;
//! ```

use super::traits::{
    ActivityBackend, GeofenceBackend, SequencedEvent, SessionBackend, StoredAppend,
};
use crate::models::{
    ActivityEvent, Geofence, GeofenceId, GroupId, LiveSession, SessionKey, UserId,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Resilience configuration for storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageResilienceConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles on each further retry.
    pub retry_backoff_ms: u64,
    /// Upper bound for a single backoff.
    pub max_backoff_ms: u64,
    /// Consecutive failures before opening the circuit.
    pub breaker_failure_threshold: u32,
    /// How long to keep the circuit open before half-open.
    pub breaker_reset_timeout_ms: u64,
    /// Maximum trial calls while half-open.
    pub breaker_half_open_max_calls: u32,
}

impl Default for StorageResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 50,
            max_backoff_ms: 1_000,
            breaker_failure_threshold: 5,
            breaker_reset_timeout_ms: 30_000,
            breaker_half_open_max_calls: 1,
        }
    }
}

impl StorageResilienceConfig {
    /// Loads resilience configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("GEOWATCH_STORAGE_MAX_RETRIES")
            && let Ok(parsed) = v.parse::<u32>()
        {
            self.max_retries = parsed;
        }
        if let Ok(v) = std::env::var("GEOWATCH_STORAGE_RETRY_BACKOFF_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.retry_backoff_ms = parsed;
        }
        if let Ok(v) = std::env::var("GEOWATCH_STORAGE_BREAKER_FAILURE_THRESHOLD")
            && let Ok(parsed) = v.parse::<u32>()
        {
            self.breaker_failure_threshold = parsed.max(1);
        }
        if let Ok(v) = std::env::var("GEOWATCH_STORAGE_BREAKER_RESET_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.breaker_reset_timeout_ms = parsed;
        }
        self
    }

    /// Sets the retry count.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the initial retry backoff in milliseconds.
    #[must_use]
    pub const fn with_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.breaker_failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout in milliseconds.
    #[must_use]
    pub const fn with_reset_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.breaker_reset_timeout_ms = timeout_ms;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.retry_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Circuit breaker state machine.
#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { attempts: u32 },
}

/// Circuit breaker for storage backends.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
    backend_name: &'static str,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: &StorageResilienceConfig, backend_name: &'static str) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            failure_threshold: config.breaker_failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.breaker_reset_timeout_ms),
            half_open_max_calls: config.breaker_half_open_max_calls.max(1),
            backend_name,
        }
    }

    /// Checks if a request is allowed through the circuit breaker.
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    tracing::info!(
                        backend = self.backend_name,
                        "Circuit breaker transitioning to half-open"
                    );
                    self.state = BreakerState::HalfOpen { attempts: 0 };
                    true
                } else {
                    false
                }
            },
            BreakerState::HalfOpen { ref mut attempts } => {
                if *attempts >= self.half_open_max_calls {
                    false
                } else {
                    *attempts += 1;
                    true
                }
            },
        }
    }

    /// Records a successful operation, closing the circuit.
    pub fn on_success(&mut self) {
        if !matches!(self.state, BreakerState::Closed { failures: 0 }) {
            tracing::info!(
                backend = self.backend_name,
                "Circuit breaker closing after success"
            );
        }
        self.state = BreakerState::Closed { failures: 0 };
    }

    /// Records a failed operation.
    ///
    /// Returns `true` if the circuit just opened (tripped).
    pub fn on_failure(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { ref mut failures } => {
                *failures += 1;
                if *failures >= self.failure_threshold {
                    tracing::warn!(
                        backend = self.backend_name,
                        failures = *failures,
                        threshold = self.failure_threshold,
                        "Circuit breaker opened after consecutive failures"
                    );
                    self.state = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                    return true;
                }
            },
            BreakerState::HalfOpen { .. } => {
                tracing::warn!(
                    backend = self.backend_name,
                    "Circuit breaker re-opened after half-open failure"
                );
                self.state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
                return true;
            },
            BreakerState::Open { .. } => {},
        }
        false
    }

    /// Returns the current state as a numeric value for metrics.
    ///
    /// - 0: Closed
    /// - 1: Open
    /// - 2: Half-Open
    #[must_use]
    pub const fn state_value(&self) -> u8 {
        match self.state {
            BreakerState::Closed { .. } => 0,
            BreakerState::Open { .. } => 1,
            BreakerState::HalfOpen { .. } => 2,
        }
    }
}

/// Backend wrapper adding retries and a circuit breaker.
///
/// Implements every storage trait its inner backend implements. Calls run
/// synchronously; backoff sleeps the calling thread, so wrapped backends are
/// expected to be driven through [`super::StorageBulkhead`].
pub struct ResilientBackend<B> {
    inner: B,
    config: StorageResilienceConfig,
    breaker: Mutex<CircuitBreaker>,
    backend_name: &'static str,
}

impl<B> ResilientBackend<B> {
    /// Creates a new resilient wrapper.
    #[must_use]
    pub fn new(inner: B, config: StorageResilienceConfig, backend_name: &'static str) -> Self {
        Self {
            breaker: Mutex::new(CircuitBreaker::new(&config, backend_name)),
            inner,
            config,
            backend_name,
        }
    }

    /// Returns the wrapped backend.
    pub const fn inner(&self) -> &B {
        &self.inner
    }

    /// Current breaker state (see [`CircuitBreaker::state_value`]).
    pub fn breaker_state(&self) -> u8 {
        self.lock_breaker().state_value()
    }

    fn lock_breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        self.breaker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn execute<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            let result = self.execute_once(operation, &call);
            match result {
                Err(ref err) if err.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self.config.backoff_for(attempt);
                    tracing::debug!(
                        backend = self.backend_name,
                        operation,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Retrying storage operation"
                    );
                    metrics::counter!(
                        "storage_retries_total",
                        "backend" => self.backend_name,
                        "operation" => operation
                    )
                    .increment(1);
                    std::thread::sleep(backoff);
                },
                other => return other,
            }
        }
    }

    fn execute_once<T>(&self, operation: &'static str, call: &dyn Fn() -> Result<T>) -> Result<T> {
        let mut breaker = self.lock_breaker();
        if !breaker.allow() {
            let state = breaker.state_value();
            drop(breaker);
            Self::record_metrics(self.backend_name, operation, "circuit_open", state);
            return Err(Error::Unavailable(format!(
                "circuit breaker open for backend '{}'",
                self.backend_name
            )));
        }
        drop(breaker);

        let result = call();

        let mut breaker = self.lock_breaker();
        match &result {
            Ok(_) => {
                breaker.on_success();
                let state = breaker.state_value();
                drop(breaker);
                Self::record_metrics(self.backend_name, operation, "success", state);
            },
            Err(err) if !err.is_transient() => {
                // Input errors say nothing about backend health
                let state = breaker.state_value();
                drop(breaker);
                Self::record_metrics(self.backend_name, operation, "rejected", state);
            },
            Err(_) => {
                let tripped = breaker.on_failure();
                let state = breaker.state_value();
                drop(breaker);
                Self::record_metrics(self.backend_name, operation, "error", state);
                if tripped {
                    metrics::counter!(
                        "storage_circuit_breaker_trips_total",
                        "backend" => self.backend_name,
                        "operation" => operation
                    )
                    .increment(1);
                }
            },
        }

        result
    }

    fn record_metrics(
        backend: &'static str,
        operation: &'static str,
        status: &'static str,
        state: u8,
    ) {
        metrics::counter!(
            "storage_requests_total",
            "backend" => backend,
            "operation" => operation,
            "status" => status
        )
        .increment(1);
        metrics::gauge!(
            "storage_circuit_breaker_state",
            "backend" => backend
        )
        .set(f64::from(state));
    }
}

impl<B: GeofenceBackend> GeofenceBackend for ResilientBackend<B> {
    fn upsert(&self, geofence: &Geofence) -> Result<()> {
        self.execute("upsert_geofence", || self.inner.upsert(geofence))
    }

    fn get(&self, id: &GeofenceId) -> Result<Option<Geofence>> {
        self.execute("get_geofence", || self.inner.get(id))
    }

    fn set_active(&self, id: &GeofenceId, active: bool) -> Result<bool> {
        self.execute("set_geofence_active", || self.inner.set_active(id, active))
    }

    fn list_active(&self, group_id: &GroupId) -> Result<Vec<Geofence>> {
        self.execute("list_active_geofences", || self.inner.list_active(group_id))
    }

    fn list_all(&self, group_id: &GroupId) -> Result<Vec<Geofence>> {
        self.execute("list_geofences", || self.inner.list_all(group_id))
    }
}

impl<B: SessionBackend> SessionBackend for ResilientBackend<B> {
    fn load(&self, key: &SessionKey) -> Result<Option<LiveSession>> {
        self.execute("load_session", || self.inner.load(key))
    }

    fn save(&self, session: &LiveSession) -> Result<()> {
        self.execute("save_session", || self.inner.save(session))
    }

    fn list_for_group(&self, group_id: &GroupId) -> Result<Vec<LiveSession>> {
        self.execute("list_sessions", || self.inner.list_for_group(group_id))
    }

    fn list_active_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionKey>> {
        self.execute("list_stale_sessions", || self.inner.list_active_before(cutoff))
    }
}

impl<B: ActivityBackend> ActivityBackend for ResilientBackend<B> {
    fn append(&self, event: &ActivityEvent) -> Result<StoredAppend> {
        self.execute("append_activity", || self.inner.append(event))
    }

    fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<ActivityEvent>> {
        self.execute("find_activity", || self.inner.find_by_dedup_key(dedup_key))
    }

    fn recent_for_user(&self, user_id: &UserId, limit: usize) -> Result<Vec<ActivityEvent>> {
        self.execute("recent_activity_for_user", || {
            self.inner.recent_for_user(user_id, limit)
        })
    }

    fn recent_for_group(&self, group_id: &GroupId, limit: usize) -> Result<Vec<ActivityEvent>> {
        self.execute("recent_activity_for_group", || {
            self.inner.recent_for_group(group_id, limit)
        })
    }

    fn last_created_at(&self, user_id: &UserId) -> Result<Option<DateTime<Utc>>> {
        self.execute("last_activity_created_at", || {
            self.inner.last_created_at(user_id)
        })
    }

    fn last_transitions(&self, user_id: &UserId, group_id: &GroupId) -> Result<Vec<ActivityEvent>> {
        self.execute("last_transitions", || {
            self.inner.last_transitions(user_id, group_id)
        })
    }

    fn events_since(
        &self,
        since: DateTime<Utc>,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<SequencedEvent>> {
        self.execute("activity_since", || {
            self.inner.events_since(since, after_seq, limit)
        })
    }

    fn count(&self) -> Result<usize> {
        self.execute("count_activity", || self.inner.count())
    }
}
