//! Persisted anomalies and their operator-driven status workflow.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::detect::cooldown::open_anomaly_within;
use crate::detect::{DetectionResult, DetectionType, Severity};
use crate::metrics::{MetricSample, MetricType, UnknownVariant};
use crate::storage::{
    db_now, parse_enum, parse_time, parse_time_opt, parse_uuid, parse_uuid_opt, to_db_time,
    to_db_time_opt, Pool, Result, StorageError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyStatus {
    Open,
    Acknowledged,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AnomalyStatus {
    pub const ALL: [AnomalyStatus; 5] = [
        AnomalyStatus::Open,
        AnomalyStatus::Acknowledged,
        AnomalyStatus::Investigating,
        AnomalyStatus::Resolved,
        AnomalyStatus::FalsePositive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyStatus::Open => "OPEN",
            AnomalyStatus::Acknowledged => "ACKNOWLEDGED",
            AnomalyStatus::Investigating => "INVESTIGATING",
            AnomalyStatus::Resolved => "RESOLVED",
            AnomalyStatus::FalsePositive => "FALSE_POSITIVE",
        }
    }

    /// Statuses that still need operator attention.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AnomalyStatus::Open | AnomalyStatus::Acknowledged | AnomalyStatus::Investigating
        )
    }
}

impl fmt::Display for AnomalyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for AnomalyStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        AnomalyStatus::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant::new("anomaly status", s))
    }
}

/// A single flagged deviation of one sample, produced by one detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub application_id: Uuid,
    pub application_name: Option<String>,
    pub metric_type: MetricType,
    pub metric_name: String,
    pub detection_type: DetectionType,
    pub severity: Severity,
    pub status: AnomalyStatus,
    pub current_value: f64,
    pub expected_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub deviation_percentage: Option<f64>,
    pub z_score: Option<f64>,
    pub description: String,
    pub host: Option<String>,
    pub environment: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub incident_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Anomaly {
    /// Build an OPEN anomaly from a positive detection. Returns `None` for
    /// results that did not flag anything.
    pub fn from_detection(sample: &MetricSample, result: &DetectionResult) -> Option<Self> {
        if !result.anomaly_detected {
            return None;
        }
        let severity = result.severity?;
        let now = db_now();
        Some(Self {
            id: Uuid::new_v4(),
            application_id: sample.application_id,
            application_name: sample.application_name.clone(),
            metric_type: sample.metric_type,
            metric_name: sample.metric_name.clone(),
            detection_type: result.detection_type,
            severity,
            status: AnomalyStatus::Open,
            current_value: result.current_value,
            expected_value: result.expected_value,
            threshold_value: result.threshold_value,
            deviation_percentage: result.deviation_percentage,
            z_score: result.z_score,
            description: result.description.clone(),
            host: sample.host.clone(),
            environment: sample.environment.clone(),
            detected_at: sample.timestamp.trunc_subsecs(3),
            resolved_at: None,
            incident_id: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Active anomaly counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyStats {
    pub total_active: u64,
    pub by_severity: BTreeMap<Severity, u64>,
}

const COLUMNS: &str = "id, application_id, application_name, metric_type, metric_name,
    detection_type, severity, status, current_value, expected_value, threshold_value,
    deviation_percentage, z_score, description, host, environment, detected_at,
    resolved_at, incident_id, created_at, updated_at";

const ACTIVE: &str = "('OPEN', 'ACKNOWLEDGED', 'INVESTIGATING')";

fn from_row(row: &Row<'_>) -> rusqlite::Result<Anomaly> {
    Ok(Anomaly {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        application_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
        application_name: row.get(2)?,
        metric_type: parse_enum(3, &row.get::<_, String>(3)?)?,
        metric_name: row.get(4)?,
        detection_type: parse_enum(5, &row.get::<_, String>(5)?)?,
        severity: parse_enum(6, &row.get::<_, String>(6)?)?,
        status: parse_enum(7, &row.get::<_, String>(7)?)?,
        current_value: row.get(8)?,
        expected_value: row.get(9)?,
        threshold_value: row.get(10)?,
        deviation_percentage: row.get(11)?,
        z_score: row.get(12)?,
        description: row.get(13)?,
        host: row.get(14)?,
        environment: row.get(15)?,
        detected_at: parse_time(16, &row.get::<_, String>(16)?)?,
        resolved_at: parse_time_opt(17, row.get(17)?)?,
        incident_id: parse_uuid_opt(18, row.get(18)?)?,
        created_at: parse_time(19, &row.get::<_, String>(19)?)?,
        updated_at: parse_time(20, &row.get::<_, String>(20)?)?,
    })
}

fn insert(conn: &Connection, a: &Anomaly) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO anomalies ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21)"
        ),
        params![
            a.id.to_string(),
            a.application_id.to_string(),
            a.application_name,
            a.metric_type.as_str(),
            a.metric_name,
            a.detection_type.as_str(),
            a.severity.as_str(),
            a.status.as_str(),
            a.current_value,
            a.expected_value,
            a.threshold_value,
            a.deviation_percentage,
            a.z_score,
            a.description,
            a.host,
            a.environment,
            to_db_time(&a.detected_at),
            to_db_time_opt(&a.resolved_at),
            a.incident_id.map(|i| i.to_string()),
            to_db_time(&a.created_at),
            to_db_time(&a.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn fetch(conn: &Connection, id: Uuid) -> Result<Anomaly> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM anomalies WHERE id = ?1"),
        params![id.to_string()],
        from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("anomaly", id))
}

/// Point an anomaly at an incident, returning the previous link.
pub(crate) fn set_incident_link(
    conn: &Connection,
    anomaly_id: Uuid,
    incident_id: Uuid,
) -> Result<Option<Uuid>> {
    let previous = fetch(conn, anomaly_id)?.incident_id;
    let incident_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM incidents WHERE id = ?1)",
        [incident_id.to_string()],
        |row| row.get(0),
    )?;
    if !incident_exists {
        return Err(StorageError::not_found("incident", incident_id));
    }
    conn.execute(
        "UPDATE anomalies SET incident_id = ?2, updated_at = ?3 WHERE id = ?1",
        params![
            anomaly_id.to_string(),
            incident_id.to_string(),
            to_db_time(&db_now())
        ],
    )?;
    Ok(previous)
}

#[derive(Clone)]
pub struct AnomalyRecorder {
    pool: Pool,
}

impl AnomalyRecorder {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Persist every positive result of one evaluation pass as an OPEN
    /// anomaly, atomically.
    ///
    /// The cooldown check is repeated under a write lock; if another pass
    /// already recorded an OPEN anomaly for the key inside the window, nothing
    /// is written and `None` is returned.
    pub fn record_pass(
        &self,
        sample: &MetricSample,
        results: &[DetectionResult],
        cooldown_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Anomaly>>> {
        let anomalies: Vec<Anomaly> = results
            .iter()
            .filter_map(|r| Anomaly::from_detection(sample, r))
            .collect();
        if anomalies.is_empty() {
            return Ok(Some(anomalies));
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if open_anomaly_within(
            &tx,
            sample.application_id,
            sample.metric_type,
            cooldown_minutes,
            now,
        )? {
            debug!(
                app_id = %sample.application_id,
                metric_type = %sample.metric_type,
                "cooldown engaged by a concurrent pass, dropping detections"
            );
            return Ok(None);
        }
        for anomaly in &anomalies {
            insert(&tx, anomaly)?;
        }
        tx.commit()?;

        for anomaly in &anomalies {
            info!(
                anomaly = %anomaly.id,
                app_id = %anomaly.application_id,
                metric_type = %anomaly.metric_type,
                detection = %anomaly.detection_type,
                severity = %anomaly.severity,
                "anomaly recorded"
            );
        }
        Ok(Some(anomalies))
    }

    pub fn get(&self, id: Uuid) -> Result<Anomaly> {
        let conn = self.pool.get()?;
        fetch(&conn, id)
    }

    /// Anomalies still needing attention, newest first.
    pub fn list_active(&self, limit: usize) -> Result<Vec<Anomaly>> {
        self.query(
            &format!("WHERE status IN {ACTIVE} ORDER BY detected_at DESC LIMIT ?1"),
            params![limit as i64],
        )
    }

    pub fn list_by_application(
        &self,
        application_id: Uuid,
        status: Option<AnomalyStatus>,
        limit: usize,
    ) -> Result<Vec<Anomaly>> {
        match status {
            Some(status) => self.query(
                "WHERE application_id = ?1 AND status = ?2 ORDER BY detected_at DESC LIMIT ?3",
                params![application_id.to_string(), status.as_str(), limit as i64],
            ),
            None => self.query(
                "WHERE application_id = ?1 ORDER BY detected_at DESC LIMIT ?2",
                params![application_id.to_string(), limit as i64],
            ),
        }
    }

    /// OPEN anomalies of one severity, newest first.
    pub fn list_open_by_severity(&self, severity: Severity, limit: usize) -> Result<Vec<Anomaly>> {
        self.query(
            "WHERE status = 'OPEN' AND severity = ?1 ORDER BY detected_at DESC LIMIT ?2",
            params![severity.as_str(), limit as i64],
        )
    }

    /// Anomalies of one application detected inside `[start, end]`, oldest first.
    pub fn list_in_range(
        &self,
        application_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Anomaly>> {
        self.query(
            "WHERE application_id = ?1 AND detected_at >= ?2 AND detected_at <= ?3
             ORDER BY detected_at ASC",
            params![
                application_id.to_string(),
                to_db_time(&start),
                to_db_time(&end)
            ],
        )
    }

    /// OPEN anomalies severe enough to escalate that have no incident yet.
    pub fn list_unescalated(&self, limit: usize) -> Result<Vec<Anomaly>> {
        self.query(
            "WHERE status = 'OPEN' AND severity IN ('HIGH', 'CRITICAL') AND incident_id IS NULL
             ORDER BY detected_at ASC LIMIT ?1",
            params![limit as i64],
        )
    }

    pub fn acknowledge(&self, id: Uuid) -> Result<Anomaly> {
        self.update_status(id, AnomalyStatus::Acknowledged)
    }

    pub fn investigate(&self, id: Uuid) -> Result<Anomaly> {
        self.update_status(id, AnomalyStatus::Investigating)
    }

    pub fn resolve(&self, id: Uuid) -> Result<Anomaly> {
        self.update_status(id, AnomalyStatus::Resolved)
    }

    pub fn mark_false_positive(&self, id: Uuid) -> Result<Anomaly> {
        self.update_status(id, AnomalyStatus::FalsePositive)
    }

    /// Set the status. RESOLVED and FALSE_POSITIVE stamp `resolved_at`.
    pub fn update_status(&self, id: Uuid, status: AnomalyStatus) -> Result<Anomaly> {
        let conn = self.pool.get()?;
        let mut anomaly = fetch(&conn, id)?;
        let now = db_now();
        anomaly.status = status;
        anomaly.updated_at = now;
        if matches!(status, AnomalyStatus::Resolved | AnomalyStatus::FalsePositive) {
            anomaly.resolved_at = Some(now);
        }

        conn.execute(
            "UPDATE anomalies SET status = ?2, resolved_at = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id.to_string(),
                status.as_str(),
                to_db_time_opt(&anomaly.resolved_at),
                to_db_time(&now)
            ],
        )?;
        debug!(anomaly = %id, %status, "anomaly status updated");
        Ok(anomaly)
    }

    /// Associate an anomaly with an existing incident, replacing any earlier
    /// link.
    pub fn link_to_incident(&self, id: Uuid, incident_id: Uuid) -> Result<Anomaly> {
        let conn = self.pool.get()?;
        set_incident_link(&conn, id, incident_id)?;
        fetch(&conn, id)
    }

    pub fn stats(&self) -> Result<AnomalyStats> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT severity, COUNT(*) FROM anomalies WHERE status IN {ACTIVE} GROUP BY severity"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                parse_enum::<Severity>(0, &row.get::<_, String>(0)?)?,
                row.get::<_, i64>(1)?,
            ))
        })?;

        let mut stats = AnomalyStats::default();
        for row in rows {
            let (severity, count) = row?;
            let count = count.max(0) as u64;
            stats.total_active += count;
            stats.by_severity.insert(severity, count);
        }
        Ok(stats)
    }

    fn query(&self, clause: &str, args: impl rusqlite::Params) -> Result<Vec<Anomaly>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM anomalies {clause}"))?;
        let rows = stmt.query_map(args, from_row)?;
        let mut anomalies = Vec::new();
        for a in rows {
            anomalies.push(a?);
        }
        Ok(anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;
    use chrono::Duration;

    fn result(kind: DetectionType, severity: Severity) -> DetectionResult {
        DetectionResult::anomaly(kind, severity, 60.0, "flagged")
    }

    fn record(recorder: &AnomalyRecorder, app: Uuid, severity: Severity) -> Anomaly {
        let sample = MetricSample::new(app, MetricType::ErrorCount, 60.0);
        recorder
            .record_pass(&sample, &[result(DetectionType::Threshold, severity)], 0, db_now())
            .unwrap()
            .unwrap()
            .remove(0)
    }

    #[test]
    fn test_every_positive_result_becomes_its_own_row() {
        let (_dir, pool) = test_pool();
        let recorder = AnomalyRecorder::new(pool);
        let sample = MetricSample::new(Uuid::new_v4(), MetricType::ErrorCount, 60.0)
            .with_host("web-1")
            .with_environment("prod");
        let results = [
            result(DetectionType::Threshold, Severity::Critical),
            DetectionResult::normal(DetectionType::ZScore, 60.0, "fine"),
            result(DetectionType::RateOfChange, Severity::High),
        ];

        let recorded = recorder.record_pass(&sample, &results, 5, db_now()).unwrap().unwrap();
        assert_eq!(recorded.len(), 2);
        for a in &recorded {
            assert_eq!(a.status, AnomalyStatus::Open);
            assert_eq!(recorder.get(a.id).unwrap(), *a);
        }
        assert_eq!(recorded[0].host.as_deref(), Some("web-1"));
        assert_eq!(recorded[0].detected_at, sample.timestamp.trunc_subsecs(3));
    }

    #[test]
    fn test_pass_is_dropped_when_key_is_cooling_down() {
        let (_dir, pool) = test_pool();
        let recorder = AnomalyRecorder::new(pool);
        let app = Uuid::new_v4();
        let now = db_now();
        let sample = MetricSample::new(app, MetricType::ErrorCount, 60.0).at(now);
        let results = [result(DetectionType::Threshold, Severity::Critical)];

        assert!(recorder.record_pass(&sample, &results, 5, now).unwrap().is_some());
        assert!(recorder.record_pass(&sample, &results, 5, now).unwrap().is_none());
        assert_eq!(recorder.list_active(10).unwrap().len(), 1);
    }

    #[test]
    fn test_status_workflow_stamps_resolution() {
        let (_dir, pool) = test_pool();
        let recorder = AnomalyRecorder::new(pool);
        let a = record(&recorder, Uuid::new_v4(), Severity::High);

        let acked = recorder.acknowledge(a.id).unwrap();
        assert_eq!(acked.status, AnomalyStatus::Acknowledged);
        assert!(acked.resolved_at.is_none());
        assert_eq!(recorder.investigate(a.id).unwrap().status, AnomalyStatus::Investigating);

        let resolved = recorder.resolve(a.id).unwrap();
        assert!(resolved.resolved_at.is_some());
        assert_eq!(recorder.get(a.id).unwrap(), resolved);

        let b = record(&recorder, Uuid::new_v4(), Severity::Low);
        let fp = recorder.mark_false_positive(b.id).unwrap();
        assert_eq!(fp.status, AnomalyStatus::FalsePositive);
        assert!(fp.resolved_at.is_some());

        assert!(recorder.list_active(10).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_anomaly_is_not_found() {
        let (_dir, pool) = test_pool();
        let recorder = AnomalyRecorder::new(pool);
        assert!(matches!(
            recorder.acknowledge(Uuid::new_v4()).unwrap_err(),
            StorageError::NotFound { entity: "anomaly", .. }
        ));
    }

    #[test]
    fn test_listings_and_stats() {
        let (_dir, pool) = test_pool();
        let recorder = AnomalyRecorder::new(pool);
        let app = Uuid::new_v4();
        let crit = record(&recorder, app, Severity::Critical);
        record(&recorder, app, Severity::High);
        let other = record(&recorder, Uuid::new_v4(), Severity::High);
        recorder.resolve(other.id).unwrap();

        assert_eq!(recorder.list_by_application(app, None, 10).unwrap().len(), 2);
        assert_eq!(
            recorder
                .list_by_application(app, Some(AnomalyStatus::Resolved), 10)
                .unwrap()
                .len(),
            0
        );
        let critical = recorder.list_open_by_severity(Severity::Critical, 10).unwrap();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].id, crit.id);

        let now = db_now();
        let in_range = recorder
            .list_in_range(app, now - Duration::minutes(1), now + Duration::minutes(1))
            .unwrap();
        assert_eq!(in_range.len(), 2);

        assert_eq!(recorder.list_unescalated(10).unwrap().len(), 2);

        let stats = recorder.stats().unwrap();
        assert_eq!(stats.total_active, 2);
        assert_eq!(stats.by_severity.get(&Severity::Critical), Some(&1));
        assert_eq!(stats.by_severity.get(&Severity::High), Some(&1));

        // Acknowledged and investigating anomalies are still active.
        recorder.acknowledge(crit.id).unwrap();
        assert_eq!(recorder.stats().unwrap().total_active, 2);
        recorder.resolve(crit.id).unwrap();
        assert_eq!(recorder.stats().unwrap().total_active, 1);
    }
}
