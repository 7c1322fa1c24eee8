//! pulsewarden -- metric anomaly detection and incident escalation.
//!
//! This crate provides the core library for threshold resolution, the four
//! detectors, cooldown suppression, anomaly recording, escalation into
//! incidents, and the incident lifecycle, plus the daemon that serves them.

pub mod api;
pub mod config;
pub mod detect;
pub mod incident;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod observability;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::PulsewardenConfig;
use crate::detect::cooldown::CooldownGate;
use crate::detect::engine::DetectionEngine;
use crate::detect::recorder::AnomalyRecorder;
use crate::detect::resolver::ThresholdStore;
use crate::incident::{EscalationMapper, IncidentManager};
use crate::ingest::Dispatcher;
use crate::notify::{LogSink, NotificationDispatcher};
use crate::observability::EngineMetrics;
use crate::storage::history::SqliteHistory;
use crate::storage::Pool;

/// Anomalies examined per escalation sweep.
const SWEEP_BATCH: usize = 500;

/// How long shutdown waits for queued notifications to be delivered.
const NOTIFY_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Every store and the engine, wired over one pool.
#[derive(Clone)]
pub struct Services {
    pub pool: Pool,
    pub thresholds: ThresholdStore,
    pub history: SqliteHistory,
    pub anomalies: AnomalyRecorder,
    pub escalation: EscalationMapper,
    pub incidents: IncidentManager,
    pub engine: DetectionEngine,
}

impl Services {
    pub fn new(pool: Pool, config: &PulsewardenConfig, notifier: NotificationDispatcher) -> Result<Self> {
        let thresholds = ThresholdStore::new(pool.clone(), config.detection.clone());
        let history = SqliteHistory::new(pool.clone());
        let anomalies = AnomalyRecorder::new(pool.clone());
        let escalation = EscalationMapper::new(pool.clone(), notifier.clone());
        let incidents = IncidentManager::new(pool.clone(), config.incidents.transition_policy, notifier);
        let metrics = EngineMetrics::new().context("failed to register engine metrics")?;
        let engine = DetectionEngine::new(
            thresholds.clone(),
            Arc::new(history.clone()),
            CooldownGate::new(pool.clone()),
            anomalies.clone(),
            escalation.clone(),
            metrics,
            config.storage.history_limit,
        );
        Ok(Self {
            pool,
            thresholds,
            history,
            anomalies,
            escalation,
            incidents,
            engine,
        })
    }

    /// Open the configured database and wire everything over it.
    pub fn open(config: &PulsewardenConfig, notifier: NotificationDispatcher) -> Result<Self> {
        let path = &config.storage.database_path;
        let pool = storage::open_pool(path)
            .with_context(|| format!("failed to open database at {path}"))?;
        Self::new(pool, config, notifier)
    }
}

/// Start the pulsewarden daemon: API server, ingest workers, and maintenance.
pub async fn serve(config: PulsewardenConfig) -> Result<()> {
    // 1. Initialize storage and notifications
    info!(db_path = %config.storage.database_path, "Initializing database");
    let (notifier, notify_task) = NotificationDispatcher::spawn(Arc::new(LogSink));
    let services = Services::open(&config, notifier)?;

    // 2. Start partitioned evaluation workers
    let dispatcher = Arc::new(Dispatcher::start(
        services.engine.clone(),
        services.history.clone(),
        config.ingest.partitions,
        config.ingest.queue_depth,
    ));

    // 3. Start maintenance loops (background tasks)
    let mut background = Vec::new();
    if config.incidents.escalation_sweep_secs > 0 {
        background.push(tokio::spawn(run_sweep_loop(
            services.clone(),
            Duration::from_secs(config.incidents.escalation_sweep_secs),
        )));
    }
    if config.storage.retention_hours > 0 {
        background.push(tokio::spawn(run_prune_loop(
            services.history.clone(),
            config.storage.retention_hours,
        )));
    }

    // 4. Start API server
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.api.bind))?;
    let app = api::router(api::state::AppState {
        engine: services.engine.clone(),
        history: services.history.clone(),
        thresholds: services.thresholds.clone(),
        anomalies: services.anomalies.clone(),
        incidents: services.incidents.clone(),
        dispatcher: Some(dispatcher.clone()),
    });

    info!(%addr, "pulsewarden listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 5. Drain queued samples, then the notifications they produced
    drain(dispatcher, background, services, notify_task).await;
    Ok(())
}

/// Stop the pipeline in dependency order. Queued samples are evaluated
/// first; the notification task then ends once every sender is gone and its
/// queue is empty.
async fn drain(
    dispatcher: Arc<Dispatcher>,
    background: Vec<JoinHandle<()>>,
    services: Services,
    notify_task: JoinHandle<()>,
) {
    match Arc::try_unwrap(dispatcher) {
        Ok(dispatcher) => dispatcher.shutdown().await,
        Err(_) => error!("dispatcher still referenced at shutdown, queued samples dropped"),
    }
    for task in background {
        task.abort();
        let _ = task.await;
    }
    drop(services);

    match tokio::time::timeout(NOTIFY_DRAIN_TIMEOUT, notify_task).await {
        Ok(Ok(())) => info!("notification queue drained"),
        Ok(Err(e)) => error!(error = %e, "notification task failed"),
        Err(_) => warn!("notification queue not drained before timeout, pending events dropped"),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Periodically escalate qualifying anomalies that never got an incident.
async fn run_sweep_loop(services: Services, period: Duration) {
    info!(period_secs = period.as_secs(), "escalation sweep started");
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let escalation = services.escalation.clone();
        let recorder = services.anomalies.clone();
        match tokio::task::spawn_blocking(move || escalation.sweep(&recorder, SWEEP_BATCH)).await {
            Ok(Ok(created)) => services.engine.metrics().add_incidents(created.len()),
            Ok(Err(e)) => error!(error = %e, "escalation sweep failed"),
            Err(e) => error!(error = %e, "escalation sweep task failed"),
        }
    }
}

/// Drop history samples older than the retention window, hourly.
async fn run_prune_loop(history: SqliteHistory, retention_hours: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        interval.tick().await;
        let cutoff = storage::db_now() - ChronoDuration::hours(retention_hours as i64);
        let history = history.clone();
        match tokio::task::spawn_blocking(move || history.prune_before(cutoff)).await {
            Ok(Ok(removed)) if removed > 0 => info!(removed, "pruned old samples"),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(error = %e, "sample pruning failed"),
            Err(e) => error!(error = %e, "sample pruning task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::metrics::{MetricSample, MetricType};
    use crate::notify::{IncidentEvent, IncidentEventKind, NotificationSink};

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<IncidentEvent>>);

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn deliver(&self, event: &IncidentEvent) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drain_delivers_events_from_queued_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PulsewardenConfig::default();
        config.storage.database_path = dir.path().join("pulsewarden.db").to_string_lossy().into_owned();

        let sink = Arc::new(RecordingSink::default());
        let (notifier, notify_task) = NotificationDispatcher::spawn(sink.clone());
        let services = Services::open(&config, notifier).unwrap();
        let dispatcher = Arc::new(Dispatcher::start(
            services.engine.clone(),
            services.history.clone(),
            2,
            16,
        ));
        let idle = tokio::spawn(std::future::pending::<()>());

        for _ in 0..3 {
            let sample = MetricSample::new(Uuid::new_v4(), MetricType::ErrorCount, 500.0);
            dispatcher.submit(sample).await.unwrap();
        }
        drain(dispatcher, vec![idle], services, notify_task).await;

        let events = sink.0.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind == IncidentEventKind::Created));
    }
}
