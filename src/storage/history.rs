//! Time-series history consumed by the statistical detectors.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::metrics::{MetricSample, MetricType};
use crate::storage::{to_db_time, Pool, Result};

/// Source of past values for one (application, metric type) key.
pub trait HistorySource: Send + Sync {
    /// Values recorded in `[window_start, window_end]`, at most `max_samples`
    /// of the most recent ones, ordered oldest first (most recent last).
    fn fetch_history(
        &self,
        application_id: Uuid,
        metric_type: MetricType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        max_samples: usize,
    ) -> Result<Vec<f64>>;
}

/// History backed by the `metric_samples` table.
#[derive(Clone)]
pub struct SqliteHistory {
    pool: Pool,
}

impl SqliteHistory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Append a sample so later evaluations see it as history.
    pub fn record(&self, sample: &MetricSample) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO metric_samples
                (application_id, metric_type, metric_name, value, host, environment, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                sample.application_id.to_string(),
                sample.metric_type.as_str(),
                sample.metric_name,
                sample.value,
                sample.host,
                sample.environment,
                to_db_time(&sample.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Drop samples older than `cutoff`. Returns the number of rows removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM metric_samples WHERE recorded_at < ?1",
            params![to_db_time(&cutoff)],
        )?;
        Ok(removed)
    }
}

impl HistorySource for SqliteHistory {
    fn fetch_history(
        &self,
        application_id: Uuid,
        metric_type: MetricType,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        max_samples: usize,
    ) -> Result<Vec<f64>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(
            "SELECT value FROM (
                 SELECT id, value, recorded_at FROM metric_samples
                 WHERE application_id = ?1 AND metric_type = ?2
                   AND recorded_at >= ?3 AND recorded_at <= ?4
                 ORDER BY recorded_at DESC, id DESC
                 LIMIT ?5
             ) ORDER BY recorded_at ASC, id ASC",
        )?;

        let rows = stmt.query_map(
            params![
                application_id.to_string(),
                metric_type.as_str(),
                to_db_time(&window_start),
                to_db_time(&window_end),
                max_samples as i64,
            ],
            |row| row.get::<_, f64>(0),
        )?;

        let mut values = Vec::new();
        for value in rows {
            values.push(value?);
        }
        Ok(values)
    }
}
