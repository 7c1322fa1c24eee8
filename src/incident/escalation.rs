//! Promotion of qualifying anomalies into incidents.

use std::fmt::Write as _;

use rusqlite::TransactionBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detect::recorder::{self, Anomaly, AnomalyRecorder};
use crate::detect::Severity;
use crate::incident::numbering::next_incident_number;
use crate::incident::{
    append_timeline, exists_for_anomaly, insert, Actor, Incident, IncidentSeverity,
    IncidentStatus, TimelineEntry, TimelineEntryType,
};
use crate::notify::{IncidentEvent, NotificationDispatcher};
use crate::storage::{db_now, Pool, Result};

/// Incident severity for an anomaly severity.
pub fn incident_severity(severity: Severity) -> IncidentSeverity {
    match severity {
        Severity::Critical => IncidentSeverity::Sev1,
        Severity::High => IncidentSeverity::Sev2,
        Severity::Medium => IncidentSeverity::Sev3,
        Severity::Low => IncidentSeverity::Sev4,
    }
}

/// Only HIGH and CRITICAL anomalies open incidents automatically.
pub fn qualifies(severity: Severity) -> bool {
    severity >= Severity::High
}

pub fn incident_title(anomaly: &Anomaly) -> String {
    format!(
        "[{}] {} anomaly detected - {}",
        anomaly.severity,
        anomaly.metric_type,
        anomaly.application_name.as_deref().unwrap_or("Unknown App")
    )
}

/// Markdown summary of the triggering anomaly.
pub fn incident_description(anomaly: &Anomaly) -> String {
    let mut out = String::from("## Anomaly Details\n\n");
    let _ = writeln!(out, "- **Detection Type:** {}", anomaly.detection_type);
    let _ = writeln!(out, "- **Metric Type:** {}", anomaly.metric_type);
    let _ = writeln!(out, "- **Metric Name:** {}", anomaly.metric_name);
    let _ = writeln!(out, "- **Current Value:** {:.2}", anomaly.current_value);
    if let Some(expected) = anomaly.expected_value {
        let _ = writeln!(out, "- **Expected Value:** {expected:.2}");
    }
    if let Some(threshold) = anomaly.threshold_value {
        let _ = writeln!(out, "- **Threshold:** {threshold:.2}");
    }
    if let Some(deviation) = anomaly.deviation_percentage {
        let _ = writeln!(out, "- **Deviation:** {deviation:.2}%");
    }
    if let Some(z) = anomaly.z_score {
        let _ = writeln!(out, "- **Z-Score:** {z:.2}");
    }
    if let Some(host) = &anomaly.host {
        let _ = writeln!(out, "- **Host:** {host}");
    }
    let _ = writeln!(out, "- **Detected At:** {}", anomaly.detected_at.to_rfc3339());
    let _ = write!(out, "\n### Analysis\n\n{}\n", anomaly.description);
    out
}

/// Creates at most one incident per anomaly.
#[derive(Clone)]
pub struct EscalationMapper {
    pool: Pool,
    notifier: NotificationDispatcher,
}

impl EscalationMapper {
    pub fn new(pool: Pool, notifier: NotificationDispatcher) -> Self {
        Self { pool, notifier }
    }

    /// Open an incident for `anomaly` if it qualifies and none exists yet.
    ///
    /// Returns `None` when skipped. Repeated or concurrent calls for the same
    /// anomaly produce a single incident.
    pub fn escalate(&self, anomaly: &Anomaly) -> Result<Option<Incident>> {
        if !qualifies(anomaly.severity) {
            debug!(anomaly = %anomaly.id, severity = %anomaly.severity, "below escalation severity");
            return Ok(None);
        }

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if exists_for_anomaly(&tx, anomaly.id)? {
            debug!(anomaly = %anomaly.id, "incident already exists for anomaly");
            return Ok(None);
        }

        let now = db_now();
        let severity = incident_severity(anomaly.severity);
        let incident = Incident {
            id: Uuid::new_v4(),
            incident_number: next_incident_number(&tx)?,
            title: incident_title(anomaly),
            description: Some(incident_description(anomaly)),
            severity,
            priority: severity.priority(),
            status: IncidentStatus::Open,
            application_id: Some(anomaly.application_id),
            application_name: anomaly.application_name.clone(),
            environment: anomaly.environment.clone(),
            affected_services: Vec::new(),
            assigned_to: None,
            assigned_team: None,
            reporter_id: None,
            root_cause: None,
            resolution: None,
            impact_summary: None,
            customers_affected: None,
            auto_created: true,
            triggering_anomaly_id: Some(anomaly.id),
            acknowledged_at: None,
            identified_at: None,
            mitigated_at: None,
            resolved_at: None,
            closed_at: None,
            time_to_acknowledge_minutes: None,
            time_to_resolve_minutes: None,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        if !insert(&tx, &incident)? {
            warn!(anomaly = %anomaly.id, "concurrent escalation won, skipping");
            return Ok(None);
        }
        append_timeline(
            &tx,
            &TimelineEntry::new(
                incident.id,
                TimelineEntryType::Created,
                "Incident auto-created from anomaly detection",
                &Actor::Automated,
                now,
            ),
        )?;
        recorder::set_incident_link(&tx, anomaly.id, incident.id)?;
        tx.commit()?;

        info!(
            incident = %incident.incident_number,
            anomaly = %anomaly.id,
            severity = %incident.severity,
            "incident auto-created"
        );
        self.notifier.dispatch(IncidentEvent::created(&incident));
        Ok(Some(incident))
    }

    /// Escalate OPEN qualifying anomalies that never got an incident, such as
    /// those left behind by a pass that failed after recording.
    pub fn sweep(&self, recorder: &AnomalyRecorder, limit: usize) -> Result<Vec<Incident>> {
        let mut created = Vec::new();
        for anomaly in recorder.list_unescalated(limit)? {
            if let Some(incident) = self.escalate(&anomaly)? {
                created.push(incident);
            }
        }
        if !created.is_empty() {
            info!(count = created.len(), "escalation sweep created incidents");
        }
        Ok(created)
    }
}
