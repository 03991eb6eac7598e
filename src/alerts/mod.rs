//! Alert dispatch.
//!
//! Newly appended activity events are broadcast by the [`AlertDispatcher`].
//! Consumers either subscribe directly (dashboards, tests) or attach an
//! [`AlertSink`] driven by [`run_sink`], which delivers at least once per
//! received event.
//!
//! # Architecture
//!
//! ```text
//! ActivityEventStore --[publish]--> AlertDispatcher --[subscribe]--> run_sink
//!                                         |                            |
//!                                         v                            v
//!                                   Subscribers                 AlertSink (log, HTTP)
//! ```

mod config;
mod delivery;
mod dispatcher;

pub use config::{AlertsConfig, HttpSinkConfig, SinkRetryConfig};
pub use delivery::{AlertSink, DeliveryResult, HttpAlertSink, LogAlertSink, run_sink};
pub use dispatcher::{AlertDispatcher, DEFAULT_ALERT_CAPACITY, FilteredReceiver};
