//! Anomaly detection: detectors, configuration resolution, cooldown, and
//! the evaluation engine that ties them together.

pub mod bands;
pub mod baseline;
pub mod cooldown;
pub mod engine;
pub mod moving_average;
pub mod rate_of_change;
pub mod recorder;
pub mod resolver;
pub mod threshold;
pub mod zscore;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::{MetricSample, UnknownVariant};

pub use self::resolver::ThresholdConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientBaseline { needed: usize, have: usize },
    #[error("baseline has zero variance")]
    ZeroVariance,
}

/// Severity levels for detected anomalies, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant::new("anomaly severity", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionType {
    Threshold,
    ZScore,
    MovingAverage,
    RateOfChange,
}

impl DetectionType {
    pub const ALL: [DetectionType; 4] = [
        DetectionType::Threshold,
        DetectionType::ZScore,
        DetectionType::MovingAverage,
        DetectionType::RateOfChange,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionType::Threshold => "THRESHOLD",
            DetectionType::ZScore => "Z_SCORE",
            DetectionType::MovingAverage => "MOVING_AVERAGE",
            DetectionType::RateOfChange => "RATE_OF_CHANGE",
        }
    }
}

impl fmt::Display for DetectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DetectionType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DetectionType::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant::new("detection type", s))
    }
}

/// Outcome of one detector for one sample. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detection_type: DetectionType,
    pub anomaly_detected: bool,
    pub severity: Option<Severity>,
    pub current_value: f64,
    pub expected_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub deviation_percentage: Option<f64>,
    pub z_score: Option<f64>,
    pub description: String,
}

impl DetectionResult {
    pub fn normal(detection_type: DetectionType, value: f64, description: impl Into<String>) -> Self {
        Self {
            detection_type,
            anomaly_detected: false,
            severity: None,
            current_value: value,
            expected_value: None,
            threshold_value: None,
            deviation_percentage: None,
            z_score: None,
            description: description.into(),
        }
    }

    pub fn anomaly(
        detection_type: DetectionType,
        severity: Severity,
        value: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            anomaly_detected: true,
            severity: Some(severity),
            ..Self::normal(detection_type, value, description)
        }
    }

    pub fn with_expected(mut self, expected: f64) -> Self {
        self.expected_value = Some(expected);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold_value = Some(threshold);
        self
    }

    pub fn with_deviation(mut self, deviation: f64) -> Self {
        self.deviation_percentage = Some(deviation);
        self
    }

    pub fn with_z_score(mut self, z: f64) -> Self {
        self.z_score = Some(z);
        self
    }
}

/// Everything a detector may consult besides the sample itself.
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub config: &'a ThresholdConfig,
    /// Past values for the sample's key, most recent last.
    pub history: &'a [f64],
}

/// A stateless classifier of one sample.
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectionType;

    fn detect(&self, sample: &MetricSample, ctx: &DetectionContext<'_>) -> DetectionResult;
}

/// The fixed set of detectors run for every evaluated sample.
pub struct DetectorSet {
    detectors: Vec<Box<dyn Detector>>,
}

impl Default for DetectorSet {
    fn default() -> Self {
        Self {
            detectors: vec![
                Box::new(threshold::ThresholdDetector),
                Box::new(zscore::ZScoreDetector),
                Box::new(moving_average::MovingAverageDetector),
                Box::new(rate_of_change::RateOfChangeDetector),
            ],
        }
    }
}

impl DetectorSet {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    /// Run every detector; results come back in detector order, positive or not.
    pub fn run(&self, sample: &MetricSample, ctx: &DetectionContext<'_>) -> Vec<DetectionResult> {
        self.detectors
            .iter()
            .map(|d| d.detect(sample, ctx))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::metrics::MetricType;
    use uuid::Uuid;

    pub fn config(metric_type: MetricType) -> ThresholdConfig {
        ThresholdConfig::synthesized(None, metric_type, &Default::default())
    }

    pub fn sample(value: f64) -> MetricSample {
        MetricSample::new(Uuid::new_v4(), MetricType::Custom, value)
    }
}
