use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::detect::cooldown::CooldownGate;
use crate::detect::recorder::{Anomaly, AnomalyRecorder};
use crate::detect::resolver::ThresholdStore;
use crate::detect::{DetectionContext, DetectionResult, DetectorSet};
use crate::incident::{EscalationMapper, Incident};
use crate::metrics::MetricSample;
use crate::observability::EngineMetrics;
use crate::storage::history::HistorySource;
use crate::storage::{db_now, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The resolved configuration is disabled.
    Disabled,
    /// The key is cooling down; no detector ran.
    Suppressed,
    Evaluated,
}

/// Result of one pass over one sample.
#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub outcome: Outcome,
    pub results: Vec<DetectionResult>,
    pub anomalies: Vec<Anomaly>,
    pub incidents: Vec<Incident>,
}

impl Evaluation {
    fn skipped(outcome: Outcome) -> Self {
        Self {
            outcome,
            results: Vec::new(),
            anomalies: Vec::new(),
            incidents: Vec::new(),
        }
    }
}

/// Runs a sample through resolution, cooldown, detection, recording and
/// escalation.
#[derive(Clone)]
pub struct DetectionEngine {
    thresholds: ThresholdStore,
    history: Arc<dyn HistorySource>,
    cooldown: CooldownGate,
    recorder: AnomalyRecorder,
    escalation: EscalationMapper,
    detectors: Arc<DetectorSet>,
    metrics: EngineMetrics,
    history_limit: usize,
}

impl DetectionEngine {
    pub fn new(
        thresholds: ThresholdStore,
        history: Arc<dyn HistorySource>,
        cooldown: CooldownGate,
        recorder: AnomalyRecorder,
        escalation: EscalationMapper,
        metrics: EngineMetrics,
        history_limit: usize,
    ) -> Self {
        Self {
            thresholds,
            history,
            cooldown,
            recorder,
            escalation,
            detectors: Arc::new(DetectorSet::default()),
            metrics,
            history_limit,
        }
    }

    pub fn with_detectors(mut self, detectors: DetectorSet) -> Self {
        self.detectors = Arc::new(detectors);
        self
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn recorder(&self) -> &AnomalyRecorder {
        &self.recorder
    }

    pub fn escalation(&self) -> &EscalationMapper {
        &self.escalation
    }

    /// Evaluate on the blocking pool.
    pub async fn evaluate(&self, sample: MetricSample) -> Result<Evaluation> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.evaluate_at(&sample, db_now())).await?
    }

    pub fn evaluate_at(&self, sample: &MetricSample, now: DateTime<Utc>) -> Result<Evaluation> {
        let started = Instant::now();
        let result = self.run(sample, now);
        self.metrics.observe_latency(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            self.metrics.inc_errors();
            error!(
                app_id = %sample.application_id,
                metric_type = %sample.metric_type,
                error = %e,
                "evaluation failed"
            );
        }
        result
    }

    fn run(&self, sample: &MetricSample, now: DateTime<Utc>) -> Result<Evaluation> {
        let config = self
            .thresholds
            .resolve(sample.application_id, sample.metric_type)?;
        if !config.enabled {
            debug!(
                app_id = %sample.application_id,
                metric_type = %sample.metric_type,
                "detection disabled for key"
            );
            return Ok(Evaluation::skipped(Outcome::Disabled));
        }

        if self.cooldown.is_cooling_down(
            sample.application_id,
            sample.metric_type,
            config.cooldown_minutes,
            now,
        )? {
            debug!(
                app_id = %sample.application_id,
                metric_type = %sample.metric_type,
                "key cooling down, skipping"
            );
            self.metrics.inc_suppressed();
            return Ok(Evaluation::skipped(Outcome::Suppressed));
        }

        let window_start = now - Duration::minutes(i64::from(config.moving_avg_window_minutes));
        let history = self.history.fetch_history(
            sample.application_id,
            sample.metric_type,
            window_start,
            now,
            self.history_limit,
        )?;

        let ctx = DetectionContext {
            config: &config,
            history: &history,
        };
        let results = self.detectors.run(sample, &ctx);
        self.metrics.inc_evaluated();

        let Some(anomalies) =
            self.recorder
                .record_pass(sample, &results, config.cooldown_minutes, now)?
        else {
            self.metrics.inc_suppressed();
            return Ok(Evaluation::skipped(Outcome::Suppressed));
        };
        self.metrics.add_anomalies(anomalies.len());

        let mut incidents = Vec::new();
        for anomaly in &anomalies {
            if let Some(incident) = self.escalation.escalate(anomaly)? {
                incidents.push(incident);
            }
        }
        self.metrics.add_incidents(incidents.len());

        if anomalies.is_empty() {
            debug!(
                app_id = %sample.application_id,
                metric_type = %sample.metric_type,
                value = sample.value,
                "sample within normal range"
            );
        } else {
            info!(
                app_id = %sample.application_id,
                metric_type = %sample.metric_type,
                anomalies = anomalies.len(),
                incidents = incidents.len(),
                "sample evaluated"
            );
        }

        Ok(Evaluation {
            outcome: Outcome::Evaluated,
            results,
            anomalies,
            incidents,
        })
    }
}
