//! Sharded, bounded ingest queue.
//!
//! Samples are routed to one of N workers by a hash of (user, group), so all
//! samples of a sequencing domain are processed in arrival order by the same
//! worker. Each worker owns a bounded queue; [`IngestPipeline::submit`] never
//! waits for space.
//!
//! [`IngestPipeline::shutdown`] stops intake and waits for the workers to
//! drain what is already queued.

use super::ingestor::{IngestConfig, IngestOutcome, LocationIngestor};
use crate::models::LocationSample;
use crate::{Error, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

struct Job {
    sample: LocationSample,
    reply: Option<oneshot::Sender<Result<IngestOutcome>>>,
}

/// Front queue of the [`LocationIngestor`].
pub struct IngestPipeline {
    senders: RwLock<Option<Vec<mpsc::Sender<Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestPipeline {
    /// Spawns the workers on the current runtime.
    #[must_use]
    pub fn start(ingestor: Arc<LocationIngestor>, config: &IngestConfig) -> Self {
        let worker_count = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for worker in 0..worker_count {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(worker, Arc::clone(&ingestor), rx)));
        }
        tracing::info!(workers = worker_count, capacity, "Ingest pipeline started");

        Self {
            senders: RwLock::new(Some(senders)),
            workers: Mutex::new(workers),
        }
    }

    /// Queues a sample without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the worker's queue is full or the
    /// pipeline is shut down.
    pub fn submit(&self, sample: LocationSample) -> Result<()> {
        let sender = self.sender_for(&sample)?;
        sender
            .try_send(Job {
                sample,
                reply: None,
            })
            .map_err(|err| {
                let reason = match err {
                    mpsc::error::TrySendError::Full(_) => "full",
                    mpsc::error::TrySendError::Closed(_) => "closed",
                };
                metrics::counter!("ingest_queue_rejections_total", "reason" => reason)
                    .increment(1);
                Error::Unavailable(format!("ingest queue {reason}"))
            })
    }

    /// Queues a sample, waiting for queue space but not for the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the pipeline is shut down.
    pub async fn enqueue(&self, sample: LocationSample) -> Result<()> {
        let sender = self.sender_for(&sample)?;
        sender
            .send(Job {
                sample,
                reply: None,
            })
            .await
            .map_err(|_| Error::Unavailable("ingest pipeline is shut down".to_string()))
    }

    /// Queues a sample and waits for its outcome.
    ///
    /// Waits for queue space instead of failing when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unavailable`] if the pipeline is shut down, or the
    /// ingest error.
    pub async fn submit_and_wait(&self, sample: LocationSample) -> Result<IngestOutcome> {
        let sender = self.sender_for(&sample)?;
        let (tx, rx) = oneshot::channel();
        sender
            .send(Job {
                sample,
                reply: Some(tx),
            })
            .await
            .map_err(|_| Error::Unavailable("ingest pipeline is shut down".to_string()))?;
        rx.await
            .map_err(|_| Error::Unavailable("ingest worker stopped".to_string()))?
    }

    /// Stops intake and waits until every queued sample is processed.
    pub async fn shutdown(&self) {
        let senders = self
            .senders
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        drop(senders);

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Ingest worker panicked");
            }
        }
        tracing::info!("Ingest pipeline drained");
    }

    /// Returns `true` once [`Self::shutdown`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.senders
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_none()
    }

    fn sender_for(&self, sample: &LocationSample) -> Result<mpsc::Sender<Job>> {
        let guard = self
            .senders
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let senders = guard
            .as_ref()
            .ok_or_else(|| Error::Unavailable("ingest pipeline is shut down".to_string()))?;
        let mut hasher = DefaultHasher::new();
        sample.key().hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let shard = (hasher.finish() % senders.len() as u64) as usize;
        Ok(senders[shard].clone())
    }
}

async fn run_worker(worker: usize, ingestor: Arc<LocationIngestor>, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        let result = ingestor.ingest(job.sample).await;
        match job.reply {
            Some(reply) => {
                let _ = reply.send(result);
            },
            None => {
                if let Err(err) = result {
                    tracing::error!(worker, error = %err, "Failed to ingest queued sample");
                }
            },
        }
    }
    tracing::debug!(worker, "Ingest worker stopped");
}
