//! Metric samples as delivered by the ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Returned when a stored or submitted enum name is not recognised.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    CpuUsage,
    MemoryUsage,
    DiskUsage,
    NetworkIn,
    NetworkOut,
    RequestCount,
    ErrorCount,
    ResponseTime,
    LatencyP50,
    LatencyP95,
    LatencyP99,
    Throughput,
    ActiveConnections,
    QueueSize,
    Custom,
}

impl MetricType {
    pub const ALL: [MetricType; 15] = [
        MetricType::CpuUsage,
        MetricType::MemoryUsage,
        MetricType::DiskUsage,
        MetricType::NetworkIn,
        MetricType::NetworkOut,
        MetricType::RequestCount,
        MetricType::ErrorCount,
        MetricType::ResponseTime,
        MetricType::LatencyP50,
        MetricType::LatencyP95,
        MetricType::LatencyP99,
        MetricType::Throughput,
        MetricType::ActiveConnections,
        MetricType::QueueSize,
        MetricType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::CpuUsage => "CPU_USAGE",
            MetricType::MemoryUsage => "MEMORY_USAGE",
            MetricType::DiskUsage => "DISK_USAGE",
            MetricType::NetworkIn => "NETWORK_IN",
            MetricType::NetworkOut => "NETWORK_OUT",
            MetricType::RequestCount => "REQUEST_COUNT",
            MetricType::ErrorCount => "ERROR_COUNT",
            MetricType::ResponseTime => "RESPONSE_TIME",
            MetricType::LatencyP50 => "LATENCY_P50",
            MetricType::LatencyP95 => "LATENCY_P95",
            MetricType::LatencyP99 => "LATENCY_P99",
            MetricType::Throughput => "THROUGHPUT",
            MetricType::ActiveConnections => "ACTIVE_CONNECTIONS",
            MetricType::QueueSize => "QUEUE_SIZE",
            MetricType::Custom => "CUSTOM",
        }
    }

    /// Seed (warning, critical) bounds used when a default configuration is
    /// synthesized. `None` leaves only the statistical detectors active.
    pub fn default_bounds(&self) -> Option<(f64, f64)> {
        match self {
            MetricType::CpuUsage | MetricType::MemoryUsage | MetricType::DiskUsage => {
                Some((80.0, 95.0))
            }
            MetricType::ErrorCount => Some((10.0, 50.0)),
            MetricType::ResponseTime | MetricType::LatencyP95 | MetricType::LatencyP99 => {
                Some((1000.0, 5000.0))
            }
            _ => None,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant::new("metric type", s))
    }
}

/// One observation of one metric for one application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub application_id: Uuid,
    #[serde(default)]
    pub application_name: Option<String>,
    pub metric_type: MetricType,
    pub metric_name: String,
    pub value: f64,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default = "crate::storage::db_now")]
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(application_id: Uuid, metric_type: MetricType, value: f64) -> Self {
        Self {
            application_id,
            application_name: None,
            metric_type,
            metric_name: metric_type.as_str().to_ascii_lowercase(),
            value,
            host: None,
            environment: None,
            timestamp: crate::storage::db_now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}
