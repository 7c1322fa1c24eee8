//! Time-windowed suppression of repeat detections.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::metrics::MetricType;
use crate::storage::{to_db_time, Pool, Result};

/// Answers "is this key still cooling down?" from the anomaly table.
///
/// A key cools down while an OPEN anomaly for it was detected strictly after
/// `now - cooldown_minutes`. The check is a plain read; the recorder repeats
/// it inside its write transaction.
#[derive(Clone)]
pub struct CooldownGate {
    pool: Pool,
}

impl CooldownGate {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn is_cooling_down(
        &self,
        application_id: Uuid,
        metric_type: MetricType,
        cooldown_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.pool.get()?;
        Ok(open_anomaly_within(
            &conn,
            application_id,
            metric_type,
            cooldown_minutes,
            now,
        )?)
    }
}

pub(crate) fn open_anomaly_within(
    conn: &Connection,
    application_id: Uuid,
    metric_type: MetricType,
    cooldown_minutes: u32,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    if cooldown_minutes == 0 {
        return Ok(false);
    }
    let since = now - Duration::minutes(i64::from(cooldown_minutes));
    conn.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM anomalies
             WHERE application_id = ?1 AND metric_type = ?2
               AND status = 'OPEN' AND detected_at > ?3
         )",
        params![
            application_id.to_string(),
            metric_type.as_str(),
            to_db_time(&since)
        ],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::recorder::{AnomalyRecorder, AnomalyStatus};
    use crate::detect::{DetectionResult, DetectionType, Severity};
    use crate::metrics::MetricSample;
    use crate::storage::{db_now, test_pool};

    fn seed_open(pool: &Pool, app: Uuid, at: DateTime<Utc>) -> Uuid {
        let sample = MetricSample::new(app, MetricType::CpuUsage, 99.0).at(at);
        let result = DetectionResult::anomaly(DetectionType::Threshold, Severity::Critical, 99.0, "hot");
        let recorded = AnomalyRecorder::new(pool.clone())
            .record_pass(&sample, &[result], 0, at)
            .unwrap()
            .unwrap();
        recorded[0].id
    }

    #[test]
    fn test_open_anomaly_inside_window_suppresses() {
        let (_dir, pool) = test_pool();
        let gate = CooldownGate::new(pool.clone());
        let app = Uuid::new_v4();
        let now = db_now();
        seed_open(&pool, app, now - Duration::minutes(1));

        assert!(gate.is_cooling_down(app, MetricType::CpuUsage, 5, now).unwrap());
        assert!(!gate.is_cooling_down(app, MetricType::MemoryUsage, 5, now).unwrap());
        assert!(!gate.is_cooling_down(Uuid::new_v4(), MetricType::CpuUsage, 5, now).unwrap());
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let (_dir, pool) = test_pool();
        let gate = CooldownGate::new(pool.clone());
        let app = Uuid::new_v4();
        let detected = db_now();
        seed_open(&pool, app, detected);

        let exactly = detected + Duration::minutes(5);
        assert!(!gate.is_cooling_down(app, MetricType::CpuUsage, 5, exactly).unwrap());
        let just_before = exactly - Duration::milliseconds(1);
        assert!(gate.is_cooling_down(app, MetricType::CpuUsage, 5, just_before).unwrap());
    }

    #[test]
    fn test_only_open_anomalies_count() {
        let (_dir, pool) = test_pool();
        let gate = CooldownGate::new(pool.clone());
        let app = Uuid::new_v4();
        let now = db_now();
        let id = seed_open(&pool, app, now);

        AnomalyRecorder::new(pool.clone())
            .update_status(id, AnomalyStatus::Acknowledged)
            .unwrap();
        assert!(!gate.is_cooling_down(app, MetricType::CpuUsage, 5, now).unwrap());
    }

    #[test]
    fn test_zero_cooldown_never_suppresses() {
        let (_dir, pool) = test_pool();
        let gate = CooldownGate::new(pool.clone());
        let app = Uuid::new_v4();
        let now = db_now();
        seed_open(&pool, app, now);
        assert!(!gate.is_cooling_down(app, MetricType::CpuUsage, 0, now).unwrap());
    }
}
