//! Alert sinks and the delivery loop.
//!
//! # Retry Strategy
//!
//! The HTTP sink retries with exponential backoff (defaults: 3 retries,
//! delays of 1s, 2s, 4s). Client errors (4xx) are not retried; network
//! errors, timeouts and 5xx responses are.
//!
//! Each event received by [`run_sink`] is handed to the sink once. A sink
//! that falls behind the dispatcher's buffer catches up from the activity
//! log, so every alert reaches it at least once. Duplicate HTTP deliveries
//! can be suppressed downstream by the `X-Geowatch-Delivery-Id` header,
//! which carries the event ID.

use super::config::{HttpSinkConfig, SinkRetryConfig};
use super::dispatcher::AlertDispatcher;
use crate::Result;
use crate::models::{ActivityEvent, EventId};
use crate::services::ActivityEventStore;
use crate::storage::SequencedEvent;
use chrono::{DateTime, Utc};
use lru::LruCache;
use secrecy::ExposeSecret;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Result of delivering one alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// Whether the delivery succeeded.
    pub success: bool,
    /// HTTP status code, if any.
    pub status_code: Option<u16>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Error message on failure.
    pub error: Option<String>,
}

impl DeliveryResult {
    /// Creates a successful result.
    #[must_use]
    pub const fn success(status_code: Option<u16>, attempts: u32, duration_ms: u64) -> Self {
        Self {
            success: true,
            status_code,
            attempts,
            duration_ms,
            error: None,
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub const fn failure(
        status_code: Option<u16>,
        error: String,
        attempts: u32,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            status_code,
            attempts,
            duration_ms,
            error: Some(error),
        }
    }

    /// Returns `true` if the event was not deliverable for this sink.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        self.success && self.attempts == 0
    }
}

/// Destination for alerts.
///
/// Implementations may block; [`run_sink`] calls them on the blocking pool.
pub trait AlertSink: Send + Sync {
    /// Sink name for logs and metrics.
    fn name(&self) -> &str;

    /// Delivers one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot attempt delivery at all; a failed
    /// attempt is reported through [`DeliveryResult`].
    fn deliver(&self, event: &ActivityEvent) -> Result<DeliveryResult>;
}

/// Sink writing each alert as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&self, event: &ActivityEvent) -> Result<DeliveryResult> {
        tracing::info!(
            event_id = %event.id,
            user_id = %event.user_id,
            group_id = %event.group_id,
            activity_type = %event.activity_type,
            geofence_id = event.geofence_id.as_ref().map(|id| id.as_str()),
            source_timestamp = %event.source_timestamp,
            "Alert"
        );
        Ok(DeliveryResult::success(None, 1, 0))
    }
}

/// Sink POSTing alerts as JSON.
pub struct HttpAlertSink {
    config: HttpSinkConfig,
    client: reqwest::blocking::Client,
}

impl HttpAlertSink {
    /// Creates a sink for one endpoint.
    #[must_use]
    pub fn new(config: HttpSinkConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("Geowatch/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.retry.timeout_secs))
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self { config, client }
    }

    fn attempt(&self, event: &ActivityEvent) -> std::result::Result<u16, AttemptError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("X-Geowatch-Event", event.activity_type.as_str())
            .header("X-Geowatch-Delivery-Id", event.id.as_str())
            .json(event);
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .map_err(|e| AttemptError::Network(format!("HTTP request failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else if status.is_client_error() {
            Err(AttemptError::Rejected(status.as_u16()))
        } else {
            Err(AttemptError::Server(status.as_u16()))
        }
    }

    fn deliver_with_retry(&self, event: &ActivityEvent) -> DeliveryResult {
        let start = Instant::now();
        let retry = &self.config.retry;
        let max_attempts = retry.max_retries + 1;

        let mut attempt = 1;
        loop {
            match self.attempt(event) {
                Ok(status) => {
                    return DeliveryResult::success(Some(status), attempt, elapsed_ms(start));
                },
                Err(AttemptError::Rejected(status)) => {
                    return DeliveryResult::failure(
                        Some(status),
                        format!("HTTP {status} response"),
                        attempt,
                        elapsed_ms(start),
                    );
                },
                Err(err) if attempt >= max_attempts => {
                    return DeliveryResult::failure(
                        err.status(),
                        err.to_string(),
                        attempt,
                        elapsed_ms(start),
                    );
                },
                Err(err) => {
                    tracing::debug!(
                        sink = %self.config.name,
                        attempt,
                        error = %err,
                        "Retrying alert delivery"
                    );
                    backoff(retry, attempt);
                    attempt += 1;
                },
            }
        }
    }
}

impl AlertSink for HttpAlertSink {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn deliver(&self, event: &ActivityEvent) -> Result<DeliveryResult> {
        if !self.config.matches_event_type(event.activity_type.as_str()) {
            return Ok(DeliveryResult::success(None, 0, 0));
        }
        Ok(self.deliver_with_retry(event))
    }
}

enum AttemptError {
    Network(String),
    Server(u16),
    Rejected(u16),
}

impl AttemptError {
    const fn status(&self) -> Option<u16> {
        match self {
            Self::Network(_) => None,
            Self::Server(status) | Self::Rejected(status) => Some(*status),
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(message) => f.write_str(message),
            Self::Server(status) | Self::Rejected(status) => write!(f, "HTTP {status} response"),
        }
    }
}

fn backoff(retry: &SinkRetryConfig, attempt: u32) {
    std::thread::sleep(Duration::from_millis(retry.delay_for_attempt(attempt)));
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Events read per backfill query.
const BACKFILL_PAGE: usize = 256;

/// Look-back before the newest delivered creation time when backfilling.
/// Creation times of different users may be slightly out of publish order.
const BACKFILL_SLACK_SECS: i64 = 5;

/// Delivered event IDs remembered to skip repeats after a backfill.
const DELIVERED_MEMORY: usize = 4_096;

/// Feeds every alert from `dispatcher` to `sink` until the dispatcher closes.
///
/// The subscription is taken when this is called, so events published
/// after the call are delivered even if the future is polled later. If the
/// sink falls behind the dispatcher's buffer, the skipped events are re-read
/// from `backfill` and delivered; without a backfill source the gap is only
/// logged and counted.
pub fn run_sink(
    dispatcher: &AlertDispatcher,
    sink: Arc<dyn AlertSink>,
    backfill: Option<Arc<ActivityEventStore>>,
) -> impl Future<Output = ()> + Send + 'static {
    let receiver = dispatcher.subscribe();
    let floor = backfill.as_ref().map(|store| store.now());
    drive_sink(receiver, sink, backfill, floor)
}

/// Delivery position of one sink.
struct SinkCursor {
    /// Newest creation time delivered, or the subscription time.
    newest: Option<DateTime<Utc>>,
    delivered: LruCache<EventId, ()>,
}

impl SinkCursor {
    fn new(floor: Option<DateTime<Utc>>) -> Self {
        let capacity = NonZeroUsize::new(DELIVERED_MEMORY).unwrap_or(NonZeroUsize::MIN);
        Self {
            newest: floor,
            delivered: LruCache::new(capacity),
        }
    }

    /// Records `event` and returns `false` if it was already delivered.
    fn admit(&mut self, event: &ActivityEvent) -> bool {
        if self.delivered.put(event.id.clone(), ()).is_some() {
            return false;
        }
        self.newest = Some(self.newest.map_or(event.created_at, |n| n.max(event.created_at)));
        true
    }
}

async fn drive_sink(
    mut receiver: broadcast::Receiver<ActivityEvent>,
    sink: Arc<dyn AlertSink>,
    backfill: Option<Arc<ActivityEventStore>>,
    floor: Option<DateTime<Utc>>,
) {
    let name = sink.name().to_string();
    let mut cursor = SinkCursor::new(floor);
    tracing::debug!(sink = %name, "Alert sink started");

    loop {
        match receiver.recv().await {
            Ok(event) => {
                if cursor.admit(&event) {
                    deliver_one(&name, &sink, event).await;
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                metrics::counter!("alert_sink_lagged_total", "sink" => name.clone())
                    .increment(skipped);
                tracing::warn!(sink = %name, skipped, "Alert sink lagged behind dispatcher");
                if let Some(store) = &backfill {
                    backfill_gap(&name, &sink, store, &mut cursor).await;
                }
            },
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!(sink = %name, "Alert dispatcher closed, sink stopping");
                break;
            },
        }
    }
}

/// Re-reads the log from just before the sink's position and delivers what
/// it has not seen yet.
async fn backfill_gap(
    name: &str,
    sink: &Arc<dyn AlertSink>,
    store: &ActivityEventStore,
    cursor: &mut SinkCursor,
) {
    let since = cursor
        .newest
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |newest| {
            newest - chrono::Duration::seconds(BACKFILL_SLACK_SECS)
        });
    let mut after_seq = 0;
    let mut recovered = 0_u64;
    loop {
        let page = match store.events_since(since, after_seq, BACKFILL_PAGE).await {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(sink = name, error = %err, "Alert backfill failed");
                metrics::counter!("alert_sink_backfill_failures_total", "sink" => name.to_string())
                    .increment(1);
                return;
            },
        };
        let Some(last) = page.last() else {
            break;
        };
        after_seq = last.seq;
        let full = page.len() == BACKFILL_PAGE;
        for SequencedEvent { event, .. } in page {
            if cursor.admit(&event) {
                deliver_one(name, sink, event).await;
                recovered += 1;
            }
        }
        if !full {
            break;
        }
    }
    metrics::counter!("alert_sink_backfilled_total", "sink" => name.to_string())
        .increment(recovered);
    tracing::info!(sink = name, recovered, since = %since, "Alert sink backfilled");
}

async fn deliver_one(name: &str, sink: &Arc<dyn AlertSink>, event: ActivityEvent) {
    let worker = Arc::clone(sink);
    let event_id = event.id.clone();
    let result = tokio::task::spawn_blocking(move || worker.deliver(&event)).await;

    let status = match result {
        Ok(Ok(delivery)) if delivery.is_skipped() => return,
        Ok(Ok(delivery)) if delivery.success => {
            metrics::histogram!("alert_delivery_duration_ms", "sink" => name.to_string())
                .record(delivery.duration_ms as f64);
            "success"
        },
        Ok(Ok(delivery)) => {
            tracing::warn!(
                sink = name,
                event_id = %event_id,
                attempts = delivery.attempts,
                error = delivery.error.as_deref().unwrap_or_default(),
                "Alert delivery failed"
            );
            "failure"
        },
        Ok(Err(err)) => {
            tracing::warn!(sink = name, event_id = %event_id, error = %err, "Alert sink error");
            "error"
        },
        Err(err) => {
            tracing::error!(sink = name, event_id = %event_id, error = %err, "Alert sink panicked");
            "error"
        },
    };
    metrics::counter!(
        "alert_deliveries_total",
        "sink" => name.to_string(),
        "status" => status
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{ActivityType, DedupKey, GroupId, NewActivityEvent, UserId};
    use crate::services::DedupConfig;
    use crate::storage::sqlite::SqliteActivityBackend;
    use crate::storage::{StorageBulkhead, StorageBulkheadConfig};
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct RecordingSink {
        delivered: Mutex<Vec<EventId>>,
    }

    impl AlertSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn deliver(&self, event: &ActivityEvent) -> Result<DeliveryResult> {
            self.delivered.lock().unwrap().push(event.id.clone());
            Ok(DeliveryResult::success(None, 1, 0))
        }
    }

    fn event(activity_type: ActivityType) -> ActivityEvent {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        ActivityEvent {
            id: EventId::generate(),
            user_id: UserId::new("alice"),
            group_id: GroupId::new("fam"),
            activity_type,
            geofence_id: None,
            payload: serde_json::json!({}),
            position: None,
            speed: None,
            source_timestamp: at,
            created_at: at,
            dedup_key: activity_type.to_string(),
        }
    }

    #[test]
    fn test_delivery_result_constructors() {
        let ok = DeliveryResult::success(Some(200), 1, 12);
        assert!(ok.success);
        assert!(!ok.is_skipped());

        let failed = DeliveryResult::failure(Some(503), "HTTP 503 response".into(), 4, 7000);
        assert!(!failed.success);
        assert_eq!(failed.status_code, Some(503));
    }

    #[test]
    fn test_http_sink_skips_unsubscribed_types() {
        let mut config = HttpSinkConfig::new("dash", "http://127.0.0.1:9/alerts");
        config.event_types = vec!["geofence_entry".into()];
        let sink = HttpAlertSink::new(config);

        let result = sink.deliver(&event(ActivityType::SpeedAlert)).unwrap();
        assert!(result.is_skipped());
    }

    #[test]
    fn test_http_sink_reports_unreachable_endpoint() {
        let mut config = HttpSinkConfig::new("dash", "http://127.0.0.1:9/alerts");
        config.retry = SinkRetryConfig {
            max_retries: 1,
            base_delay_ms: 1,
            timeout_secs: 1,
        };
        let sink = HttpAlertSink::new(config);

        let result = sink.deliver(&event(ActivityType::GeofenceEntry)).unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts, 2);
        assert!(result.status_code.is_none());
    }

    #[test]
    fn test_log_sink_accepts_everything() {
        let result = LogAlertSink.deliver(&event(ActivityType::GeofenceExit)).unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_run_sink_delivers_until_closed() {
        let dispatcher = AlertDispatcher::new(16);
        let sink = Arc::new(RecordingSink {
            delivered: Mutex::new(Vec::new()),
        });
        let task = tokio::spawn(run_sink(
            &dispatcher,
            Arc::clone(&sink) as Arc<dyn AlertSink>,
            None,
        ));

        let first = event(ActivityType::GeofenceEntry);
        let second = event(ActivityType::GeofenceExit);
        dispatcher.publish(first.clone());
        dispatcher.publish(second.clone());
        dispatcher.close();
        task.await.unwrap();

        assert_eq!(*sink.delivered.lock().unwrap(), vec![first.id, second.id]);
    }

    fn location_update(secs: i64) -> NewActivityEvent {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs);
        let user_id = UserId::new("alice");
        let group_id = GroupId::new("fam");
        NewActivityEvent {
            dedup_key: DedupKey::per_sample(&user_id, &group_id, ActivityType::LocationUpdate, at),
            user_id,
            group_id,
            activity_type: ActivityType::LocationUpdate,
            geofence_id: None,
            payload: serde_json::json!({}),
            position: None,
            speed: None,
            source_timestamp: at,
        }
    }

    #[tokio::test]
    async fn test_lagging_sink_catches_up_from_log() {
        let dispatcher = AlertDispatcher::new(1);
        let store = Arc::new(ActivityEventStore::new(
            Arc::new(SqliteActivityBackend::in_memory().unwrap()),
            StorageBulkhead::new(StorageBulkheadConfig::default(), "test"),
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap())),
            dispatcher.clone(),
            DedupConfig::default(),
        ));
        let sink = Arc::new(RecordingSink {
            delivered: Mutex::new(Vec::new()),
        });
        // Subscribed now, polled only after the buffer has overflowed
        let delivery = run_sink(
            &dispatcher,
            Arc::clone(&sink) as Arc<dyn AlertSink>,
            Some(Arc::clone(&store)),
        );

        let mut appended = Vec::new();
        for secs in 0..12 {
            let outcome = store.append(location_update(secs)).await.unwrap();
            appended.push(outcome.event().id.clone());
        }
        dispatcher.close();
        delivery.await;

        let delivered = sink.delivered.lock().unwrap().clone();
        assert_eq!(delivered, appended);
    }

    #[tokio::test]
    async fn test_lagging_sink_without_log_skips_gap() {
        let dispatcher = AlertDispatcher::new(1);
        let sink = Arc::new(RecordingSink {
            delivered: Mutex::new(Vec::new()),
        });
        let delivery = run_sink(&dispatcher, Arc::clone(&sink) as Arc<dyn AlertSink>, None);

        let first = event(ActivityType::GeofenceEntry);
        let last = event(ActivityType::GeofenceExit);
        dispatcher.publish(first);
        dispatcher.publish(last.clone());
        dispatcher.close();
        delivery.await;

        assert_eq!(*sink.delivered.lock().unwrap(), vec![last.id]);
    }
}
