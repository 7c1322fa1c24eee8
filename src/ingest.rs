//! Partitioned evaluation workers.
//!
//! Samples are routed by application id to one of N workers, each draining a
//! bounded queue in order. Every key therefore sees its samples evaluated in
//! arrival order, while distinct applications proceed in parallel.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::detect::engine::DetectionEngine;
use crate::metrics::MetricSample;
use crate::storage::history::SqliteHistory;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("dispatcher is shut down")]
    Closed,
    #[error("partition {0} queue is full")]
    Full(usize),
}

/// Evaluation attempts per sample before it is dropped.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(20);

/// Partition owning `application_id`.
pub fn partition_for(application_id: Uuid, partitions: usize) -> usize {
    (application_id.as_u128() % partitions.max(1) as u128) as usize
}

pub struct Dispatcher {
    queues: Vec<mpsc::Sender<MetricSample>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn `partitions` workers. Must be called inside a runtime.
    pub fn start(
        engine: DetectionEngine,
        history: SqliteHistory,
        partitions: usize,
        queue_depth: usize,
    ) -> Self {
        let partitions = partitions.max(1);
        let mut queues = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            queues.push(tx);
            workers.push(tokio::spawn(run_partition(
                partition,
                rx,
                engine.clone(),
                history.clone(),
            )));
        }
        info!(partitions, queue_depth, "evaluation dispatcher started");
        Self { queues, workers }
    }

    pub fn partitions(&self) -> usize {
        self.queues.len()
    }

    /// Queue a sample, waiting for room in its partition.
    pub async fn submit(&self, sample: MetricSample) -> Result<(), SubmitError> {
        let idx = partition_for(sample.application_id, self.queues.len());
        self.queues[idx]
            .send(sample)
            .await
            .map_err(|_| SubmitError::Closed)
    }

    /// Queue a sample without waiting.
    pub fn try_submit(&self, sample: MetricSample) -> Result<(), SubmitError> {
        let idx = partition_for(sample.application_id, self.queues.len());
        self.queues[idx].try_send(sample).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full(idx),
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Close every queue and wait for the workers to drain them.
    pub async fn shutdown(self) {
        drop(self.queues);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "partition worker panicked");
            }
        }
        info!("evaluation dispatcher stopped");
    }
}

async fn run_partition(
    partition: usize,
    mut rx: mpsc::Receiver<MetricSample>,
    engine: DetectionEngine,
    history: SqliteHistory,
) {
    debug!(partition, "partition worker started");
    while let Some(sample) = rx.recv().await {
        if !evaluate_with_retry(partition, &engine, &sample).await {
            // A sample that was never evaluated must not become history.
            error!(
                partition,
                app_id = %sample.application_id,
                metric = %sample.metric_type,
                attempts = MAX_ATTEMPTS,
                "evaluation abandoned, sample dropped"
            );
            continue;
        }

        let history = history.clone();
        let app_id = sample.application_id;
        let stored = tokio::task::spawn_blocking(move || history.record(&sample)).await;
        match stored {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(partition, app_id = %app_id, error = %e, "failed to store sample"),
            Err(e) => error!(partition, app_id = %app_id, error = %e, "sample store task failed"),
        }
    }
    debug!(partition, "partition worker stopped");
}

/// Redeliver a failed evaluation with doubling backoff. Failures are logged
/// and counted by the engine; this only decides whether to try again.
async fn evaluate_with_retry(partition: usize, engine: &DetectionEngine, sample: &MetricSample) -> bool {
    let mut delay = RETRY_BASE;
    for attempt in 1..=MAX_ATTEMPTS {
        match engine.evaluate(sample.clone()).await {
            Ok(_) => return true,
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(partition, attempt, error = %e, "evaluation failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(_) => {}
        }
    }
    false
}
