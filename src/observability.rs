//! Prometheus metrics for the evaluation pipeline.
//!
//! Each [`EngineMetrics`] owns its own registry so independent engines (and
//! tests) never collide on metric names.

use std::sync::Arc;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};

/// Latency buckets in seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

struct Inner {
    registry: Registry,
    samples_evaluated: IntCounter,
    samples_suppressed: IntCounter,
    anomalies_detected: IntCounter,
    incidents_created: IntCounter,
    evaluation_errors: IntCounter,
    evaluation_latency_seconds: Histogram,
}

/// Cloneable handle; clones share counters.
#[derive(Clone)]
pub struct EngineMetrics {
    inner: Arc<Inner>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let evaluation_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "pulsewarden_evaluation_latency_seconds",
                "Time spent evaluating one metric sample",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(evaluation_latency_seconds.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                samples_evaluated: counter(
                    &registry,
                    "pulsewarden_samples_evaluated_total",
                    "Samples run through the detectors",
                )?,
                samples_suppressed: counter(
                    &registry,
                    "pulsewarden_samples_suppressed_total",
                    "Samples skipped because their key was cooling down",
                )?,
                anomalies_detected: counter(
                    &registry,
                    "pulsewarden_anomalies_detected_total",
                    "Anomalies persisted",
                )?,
                incidents_created: counter(
                    &registry,
                    "pulsewarden_incidents_created_total",
                    "Incidents opened by escalation",
                )?,
                evaluation_errors: counter(
                    &registry,
                    "pulsewarden_evaluation_errors_total",
                    "Evaluations that failed with a storage error",
                )?,
                evaluation_latency_seconds,
                registry,
            }),
        })
    }

    pub fn inc_evaluated(&self) {
        self.inner.samples_evaluated.inc();
    }

    pub fn inc_suppressed(&self) {
        self.inner.samples_suppressed.inc();
    }

    pub fn add_anomalies(&self, n: usize) {
        self.inner.anomalies_detected.inc_by(n as u64);
    }

    pub fn add_incidents(&self, n: usize) {
        self.inner.incidents_created.inc_by(n as u64);
    }

    pub fn inc_errors(&self) {
        self.inner.evaluation_errors.inc();
    }

    pub fn observe_latency(&self, secs: f64) {
        self.inner.evaluation_latency_seconds.observe(secs);
    }

    pub fn evaluated(&self) -> u64 {
        self.inner.samples_evaluated.get()
    }

    pub fn suppressed(&self) -> u64 {
        self.inner.samples_suppressed.get()
    }

    pub fn errors(&self) -> u64 {
        self.inner.evaluation_errors.get()
    }

    /// Text exposition format, as served on `/metrics`.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.inner.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
