use std::sync::Arc;

use crate::detect::engine::DetectionEngine;
use crate::detect::recorder::AnomalyRecorder;
use crate::detect::resolver::ThresholdStore;
use crate::incident::IncidentManager;
use crate::ingest::Dispatcher;
use crate::storage::history::SqliteHistory;

#[derive(Clone)]
pub struct AppState {
    pub engine: DetectionEngine,
    pub history: SqliteHistory,
    pub thresholds: ThresholdStore,
    pub anomalies: AnomalyRecorder,
    pub incidents: IncidentManager,
    /// Present when the daemon runs partitioned workers.
    pub dispatcher: Option<Arc<Dispatcher>>,
}
