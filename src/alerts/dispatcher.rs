//! Broadcast channel for newly appended activity events.

use crate::models::{ActivityEvent, ActivityType, GroupId};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Default buffer size of the alert channel.
pub const DEFAULT_ALERT_CAPACITY: usize = 1024;

/// Fan-out of activity events to alert consumers.
///
/// Publishing never blocks. A subscriber that falls more than the channel
/// capacity behind loses the oldest events and observes
/// [`broadcast::error::RecvError::Lagged`].
#[derive(Clone)]
pub struct AlertDispatcher {
    sender: Arc<RwLock<Option<broadcast::Sender<ActivityEvent>>>>,
}

/// Receiver yielding only events that match a predicate.
pub struct FilteredReceiver<F> {
    receiver: broadcast::Receiver<ActivityEvent>,
    predicate: F,
}

impl AlertDispatcher {
    /// Creates a dispatcher with the given buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(RwLock::new(Some(sender))),
        }
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, event: ActivityEvent) {
        let guard = self
            .sender
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            metrics::counter!("alert_bus_publish_failed_total", "reason" => "closed").increment(1);
            return;
        };

        metrics::counter!(
            "alert_bus_publish_total",
            "type" => event.activity_type.as_str()
        )
        .increment(1);
        metrics::gauge!("alert_bus_receivers").set(sender.receiver_count() as f64);
        match sender.send(event) {
            Ok(_) => {
                metrics::gauge!("alert_bus_queue_depth").set(sender.len() as f64);
            },
            Err(_) => {
                metrics::counter!("alert_bus_publish_failed_total", "reason" => "no_receivers")
                    .increment(1);
            },
        }
    }

    /// Subscribes to every event published from now on.
    ///
    /// After [`Self::close`] the returned receiver reports `Closed` at once.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        let guard = self
            .sender
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(sender) = guard.as_ref() {
            metrics::counter!("alert_bus_subscriptions_total").increment(1);
            sender.subscribe()
        } else {
            let (_closed, receiver) = broadcast::channel(1);
            receiver
        }
    }

    /// Subscribes with a predicate.
    #[must_use]
    pub fn subscribe_filtered<F>(&self, predicate: F) -> FilteredReceiver<F>
    where
        F: Fn(&ActivityEvent) -> bool,
    {
        FilteredReceiver {
            receiver: self.subscribe(),
            predicate,
        }
    }

    /// Subscribes to the events of one group.
    #[must_use]
    pub fn subscribe_group(
        &self,
        group_id: GroupId,
    ) -> FilteredReceiver<impl Fn(&ActivityEvent) -> bool> {
        self.subscribe_filtered(move |event| event.group_id == group_id)
    }

    /// Subscribes to geofence entries and exits only.
    #[must_use]
    pub fn subscribe_transitions(&self) -> FilteredReceiver<impl Fn(&ActivityEvent) -> bool> {
        self.subscribe_filtered(|event| ActivityType::is_transition(&event.activity_type))
    }

    /// Closes the channel.
    ///
    /// Subscribers still receive buffered events, then `Closed`. Later
    /// publishes are dropped.
    pub fn close(&self) {
        let taken = self
            .sender
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if taken.is_some() {
            tracing::debug!("Alert dispatcher closed");
        }
    }

    /// Returns `true` once [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_none()
    }
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&ActivityEvent) -> bool,
{
    /// Receives the next matching event.
    ///
    /// Lagged gaps are counted and skipped.
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the dispatcher is closed and drained.
    pub async fn recv(&mut self) -> Result<ActivityEvent, broadcast::error::RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if (self.predicate)(&event) {
                        return Ok(event);
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    metrics::counter!("alert_bus_lagged_total").increment(skipped);
                },
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Coordinate, EventId, UserId};
    use chrono::{TimeZone, Utc};

    fn event(group: &str, activity_type: ActivityType) -> ActivityEvent {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        ActivityEvent {
            id: EventId::generate(),
            user_id: UserId::new("alice"),
            group_id: GroupId::new(group),
            activity_type,
            geofence_id: None,
            payload: serde_json::json!({}),
            position: Some(Coordinate::new(28.6, 77.2)),
            speed: None,
            source_timestamp: at,
            created_at: at,
            dedup_key: format!("{group}-{activity_type}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_group_skips_other_groups() {
        let dispatcher = AlertDispatcher::new(16);
        let mut filtered = dispatcher.subscribe_group(GroupId::new("fam"));

        dispatcher.publish(event("work", ActivityType::GeofenceEntry));
        dispatcher.publish(event("fam", ActivityType::GeofenceExit));

        let received = filtered.recv().await.unwrap();
        assert_eq!(received.group_id.as_str(), "fam");
        assert_eq!(received.activity_type, ActivityType::GeofenceExit);
    }

    #[tokio::test]
    async fn test_close_drains_then_reports_closed() {
        let dispatcher = AlertDispatcher::new(16);
        let mut rx = dispatcher.subscribe();

        dispatcher.publish(event("fam", ActivityType::GeofenceEntry));
        dispatcher.close();
        dispatcher.publish(event("fam", ActivityType::GeofenceExit));

        assert_eq!(
            rx.recv().await.unwrap().activity_type,
            ActivityType::GeofenceEntry
        );
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(dispatcher.is_closed());
        assert!(matches!(
            dispatcher.subscribe().recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_filtered_receiver_skips_lag() {
        let dispatcher = AlertDispatcher::new(2);
        let mut transitions = dispatcher.subscribe_transitions();

        for _ in 0..4 {
            dispatcher.publish(event("fam", ActivityType::LocationUpdate));
        }
        dispatcher.publish(event("fam", ActivityType::GeofenceEntry));

        let received = transitions.recv().await.unwrap();
        assert_eq!(received.activity_type, ActivityType::GeofenceEntry);
    }
}
