//! Bulkhead for blocking storage calls.
//!
//! Storage backends are synchronous (`rusqlite`). The bulkhead runs each call
//! on the blocking thread pool, limits how many run at once with a
//! semaphore, and bounds how long the async caller waits for the result.
//!
//! # Usage
//!
//! ```rust,ignore
//! use geowatch::storage::{StorageBulkhead, StorageBulkheadConfig};
//!
//! let bulkhead = StorageBulkhead::new(StorageBulkheadConfig::default(), "activity");
//! let backend = Arc::clone(&activity);
//! let count = bulkhead.run("count", move || backend.count()).await?;
//! ```
//!
//! A call that exceeds its deadline returns [`Error::Timeout`]. The blocking
//! call itself cannot be cancelled; it keeps its permit until it finishes,
//! so a hung database cannot accumulate unbounded work.

use crate::{Error, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for the storage bulkhead.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageBulkheadConfig {
    /// Maximum concurrent storage operations allowed.
    ///
    /// Default: 10.
    pub max_concurrent: usize,

    /// Timeout for acquiring a permit in milliseconds (0 = no timeout).
    ///
    /// Default: 5000ms.
    pub acquire_timeout_ms: u64,

    /// Deadline for one storage call in milliseconds.
    ///
    /// Default: 2000ms.
    pub call_timeout_ms: u64,

    /// Whether to fail fast when the bulkhead is full (vs. waiting).
    ///
    /// Default: false.
    pub fail_fast: bool,
}

impl Default for StorageBulkheadConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBulkheadConfig {
    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_concurrent: 10,
            acquire_timeout_ms: 5000,
            call_timeout_ms: 2000,
            fail_fast: false,
        }
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `GEOWATCH_STORAGE_BULKHEAD_MAX_CONCURRENT` | Max concurrent operations | 10 |
    /// | `GEOWATCH_STORAGE_CALL_TIMEOUT_MS` | Per-call deadline | 2000 |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("GEOWATCH_STORAGE_BULKHEAD_MAX_CONCURRENT")
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.max_concurrent = parsed.max(1);
        }
        if let Ok(v) = std::env::var("GEOWATCH_STORAGE_CALL_TIMEOUT_MS")
            && let Ok(parsed) = v.parse::<u64>()
        {
            self.call_timeout_ms = parsed.max(1);
        }
        self
    }

    /// Sets the maximum concurrent operations.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Sets the per-call deadline in milliseconds.
    #[must_use]
    pub const fn with_call_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.call_timeout_ms = timeout_ms;
        self
    }

    /// Sets whether to fail fast when the bulkhead is full.
    #[must_use]
    pub const fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Concurrency limiter and deadline for blocking storage calls.
#[derive(Debug, Clone)]
pub struct StorageBulkhead {
    config: StorageBulkheadConfig,
    semaphore: Arc<Semaphore>,
    name: &'static str,
}

impl StorageBulkhead {
    /// Creates a bulkhead.
    #[must_use]
    pub fn new(config: StorageBulkheadConfig, name: &'static str) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            semaphore,
            name,
        }
    }

    /// Returns the current number of available permits.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Runs `call` with the configured deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the call misses its deadline,
    /// [`Error::Unavailable`] if no permit could be acquired, or the call's
    /// own error.
    pub async fn run<T, F>(&self, operation: &'static str, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.run_with_timeout(
            operation,
            Duration::from_millis(self.config.call_timeout_ms.max(1)),
            call,
        )
        .await
    }

    /// Runs `call` with an explicit deadline.
    ///
    /// # Errors
    ///
    /// Same as [`Self::run`].
    pub async fn run_with_timeout<T, F>(
        &self,
        operation: &'static str,
        timeout: Duration,
        call: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let permit = self.acquire_permit().await?;

        tracing::trace!(
            bulkhead = self.name,
            operation,
            "Acquired storage bulkhead permit"
        );

        let handle = tokio::task::spawn_blocking(move || {
            let result = call();
            drop(permit);
            result
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(Error::OperationFailed {
                operation: operation.to_string(),
                cause: format!("storage task failed: {join_err}"),
            }),
            Err(_) => {
                metrics::counter!(
                    "storage_bulkhead_timeouts_total",
                    "bulkhead" => self.name,
                    "operation" => operation
                )
                .increment(1);
                tracing::warn!(
                    bulkhead = self.name,
                    operation,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Storage call timed out"
                );
                Err(Error::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            },
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let available = self.semaphore.available_permits();
        metrics::gauge!(
            "storage_bulkhead_available_permits",
            "bulkhead" => self.name
        )
        .set(available as f64);

        if self.config.fail_fast {
            return Arc::clone(&self.semaphore)
                .try_acquire_owned()
                .map_err(|_| self.rejected("full"));
        }

        let timeout_ms = if self.config.acquire_timeout_ms == 0 {
            60_000
        } else {
            self.config.acquire_timeout_ms
        };

        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(self.rejected("closed")),
            Err(_) => Err(self.rejected("timeout")),
        }
    }

    fn rejected(&self, reason: &'static str) -> Error {
        metrics::counter!(
            "storage_bulkhead_rejections_total",
            "bulkhead" => self.name,
            "reason" => reason
        )
        .increment(1);
        Error::Unavailable(format!(
            "storage bulkhead '{}' rejected call ({reason}, max {})",
            self.name, self.config.max_concurrent
        ))
    }
}
