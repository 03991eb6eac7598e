//! Alert sink configuration.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

/// `[alerts]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Broadcast buffer size.
    pub capacity: usize,
    /// Whether to log every alert through `tracing`.
    pub log: bool,
    /// HTTP endpoints (`[[alerts.http]]`).
    pub http: Vec<HttpSinkConfig>,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            capacity: super::DEFAULT_ALERT_CAPACITY,
            log: true,
            http: Vec::new(),
        }
    }
}

/// One HTTP alert endpoint.
#[derive(Debug, Deserialize)]
pub struct HttpSinkConfig {
    /// Endpoint name, used in logs and metrics.
    pub name: String,
    /// Target URL; events are POSTed as JSON.
    pub url: String,
    /// Optional bearer token.
    #[serde(default, with = "secret_string_serde")]
    pub bearer_token: Option<SecretString>,
    /// Activity types to deliver (empty = all).
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Retry behavior.
    #[serde(default)]
    pub retry: SinkRetryConfig,
}

impl Clone for HttpSinkConfig {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            url: self.url.clone(),
            bearer_token: self
                .bearer_token
                .as_ref()
                .map(|token| SecretString::from(token.expose_secret().to_owned())),
            event_types: self.event_types.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl HttpSinkConfig {
    /// Creates an endpoint with default retries and no token.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            bearer_token: None,
            event_types: Vec::new(),
            retry: SinkRetryConfig::default(),
        }
    }

    /// Checks if an activity type should be delivered.
    #[must_use]
    pub fn matches_event_type(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == "*" || t == event_type)
    }
}

/// Retry configuration for HTTP delivery.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SinkRetryConfig {
    /// Maximum number of retry attempts (default: 3).
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff (default: 1000).
    pub base_delay_ms: u64,
    /// Request timeout in seconds (default: 10).
    pub timeout_secs: u64,
}

impl Default for SinkRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            timeout_secs: 10,
        }
    }
}

impl SinkRetryConfig {
    /// Delay before retry `attempt` (1-based): `base_delay_ms * 2^(attempt - 1)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        self.base_delay_ms
            .saturating_mul(1 << (attempt - 1).min(10))
    }
}

mod secret_string_serde {
    use secrecy::SecretString;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = Option::<String>::deserialize(deserializer)?;
        Ok(token.filter(|t| !t.is_empty()).map(SecretString::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_calculation() {
        let retry = SinkRetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), 0);
        assert_eq!(retry.delay_for_attempt(1), 1000);
        assert_eq!(retry.delay_for_attempt(2), 2000);
        assert_eq!(retry.delay_for_attempt(3), 4000);
    }

    #[test]
    fn test_parse_http_sink() {
        let config: AlertsConfig = toml::from_str(
            r#"
            [[http]]
            name = "family-dashboard"
            url = "https://example.invalid/hooks/geowatch"
            bearer_token = "s3cret"
            event_types = ["geofence_entry", "geofence_exit"]
            "#,
        )
        .unwrap();

        assert!(config.log);
        let sink = &config.http[0];
        assert_eq!(sink.name, "family-dashboard");
        assert_eq!(
            sink.bearer_token.as_ref().map(|t| t.expose_secret()),
            Some("s3cret")
        );
        assert!(sink.matches_event_type("geofence_exit"));
        assert!(!sink.matches_event_type("speed_alert"));
        assert!(!format!("{sink:?}").contains("s3cret"));
    }
}
