use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::detect::recorder::{self, Anomaly};
use crate::incident::numbering::next_incident_number;
use crate::incident::{
    append_timeline, fetch, from_row, insert, timeline_from_row, write_back, Actor, Incident,
    IncidentSeverity, IncidentStats, IncidentStatus, IncidentUpdate, NewIncident, TimelineEntry,
    TimelineEntryType, TransitionPolicy, ACTIVE, COLUMNS,
};
use crate::notify::{IncidentEvent, NotificationDispatcher};
use crate::storage::{db_now, parse_enum, to_db_time, Pool, Result, StorageError};

/// Window for the averaged SLA figures in [`IncidentStats`].
const STATS_WINDOW_DAYS: i64 = 30;

/// Owns incident lifecycle, timeline and SLA timestamps.
///
/// Every mutation and the timeline entries it produces commit in one
/// transaction. Notification events are queued only after the commit.
#[derive(Clone)]
pub struct IncidentManager {
    pool: Pool,
    policy: TransitionPolicy,
    notifier: NotificationDispatcher,
}

impl IncidentManager {
    pub fn new(pool: Pool, policy: TransitionPolicy, notifier: NotificationDispatcher) -> Self {
        Self {
            pool,
            policy,
            notifier,
        }
    }

    pub fn create(&self, req: NewIncident, reporter: &Actor) -> Result<Incident> {
        if req.title.trim().is_empty() {
            return Err(StorageError::Invalid("incident title must not be empty".into()));
        }
        let now = db_now();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let incident = Incident {
            id: Uuid::new_v4(),
            incident_number: next_incident_number(&tx)?,
            title: req.title,
            description: req.description,
            severity: req.severity,
            priority: req.priority.unwrap_or_else(|| req.severity.priority()),
            status: IncidentStatus::Open,
            application_id: req.application_id,
            application_name: req.application_name,
            environment: req.environment,
            affected_services: req.affected_services,
            assigned_to: req.assigned_to,
            assigned_team: req.assigned_team,
            reporter_id: reporter.user_id(),
            root_cause: None,
            resolution: None,
            impact_summary: req.impact_summary,
            customers_affected: req.customers_affected,
            auto_created: false,
            triggering_anomaly_id: None,
            acknowledged_at: None,
            identified_at: None,
            mitigated_at: None,
            resolved_at: None,
            closed_at: None,
            time_to_acknowledge_minutes: None,
            time_to_resolve_minutes: None,
            tags: req.tags,
            created_at: now,
            updated_at: now,
        };
        insert(&tx, &incident)?;
        append_timeline(
            &tx,
            &TimelineEntry::new(
                incident.id,
                TimelineEntryType::Created,
                "Incident created manually",
                reporter,
                now,
            ),
        )?;
        tx.commit()?;

        info!(incident = %incident.incident_number, severity = %incident.severity, "incident created");
        self.notifier.dispatch(IncidentEvent::created(&incident));
        Ok(incident)
    }

    pub fn get(&self, id: Uuid) -> Result<Incident> {
        let conn = self.pool.get()?;
        fetch(&conn, id)
    }

    pub fn get_by_number(&self, number: &str) -> Result<Incident> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM incidents WHERE incident_number = ?1"),
            params![number],
            from_row,
        )
        .optional()?
        .ok_or_else(|| StorageError::not_found("incident", number))
    }

    /// Incidents not yet RESOLVED or CLOSED, newest first.
    pub fn list_active(&self, limit: usize) -> Result<Vec<Incident>> {
        self.query(
            &format!("WHERE {ACTIVE} ORDER BY created_at DESC LIMIT ?1"),
            params![limit as i64],
        )
    }

    pub fn list_by_application(&self, application_id: Uuid, limit: usize) -> Result<Vec<Incident>> {
        self.query(
            "WHERE application_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            params![application_id.to_string(), limit as i64],
        )
    }

    /// Apply field edits. Severity, priority, assignment and root cause
    /// changes each append a timeline entry; other fields are descriptive.
    pub fn update(&self, id: Uuid, changes: IncidentUpdate, actor: &Actor) -> Result<Incident> {
        let now = db_now();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut incident = fetch(&tx, id)?;
        let mut entries = Vec::new();
        let entry = |kind, message: String, old: Option<String>, new: Option<String>| {
            TimelineEntry::new(id, kind, message, actor, now).with_change(old, new)
        };

        if let Some(title) = changes.title {
            if title.trim().is_empty() {
                return Err(StorageError::Invalid("incident title must not be empty".into()));
            }
            incident.title = title;
        }
        if let Some(severity) = changes.severity.filter(|s| *s != incident.severity) {
            entries.push(entry(
                TimelineEntryType::SeverityChanged,
                format!("Severity changed from {} to {}", incident.severity, severity),
                Some(incident.severity.to_string()),
                Some(severity.to_string()),
            ));
            incident.severity = severity;
        }
        if let Some(priority) = changes.priority.filter(|p| *p != incident.priority) {
            entries.push(entry(
                TimelineEntryType::PriorityChanged,
                format!("Priority changed from {} to {}", incident.priority, priority),
                Some(incident.priority.to_string()),
                Some(priority.to_string()),
            ));
            incident.priority = priority;
        }
        if let Some(assignee) = changes.assigned_to.filter(|a| Some(*a) != incident.assigned_to) {
            entries.push(entry(
                TimelineEntryType::Assigned,
                format!("Incident assigned to {assignee}"),
                incident.assigned_to.map(|a| a.to_string()),
                Some(assignee.to_string()),
            ));
            incident.assigned_to = Some(assignee);
        }
        if let Some(root_cause) = changes
            .root_cause
            .filter(|r| Some(r) != incident.root_cause.as_ref())
        {
            entries.push(entry(
                TimelineEntryType::RootCauseIdentified,
                format!("Root cause identified: {root_cause}"),
                incident.root_cause.clone(),
                Some(root_cause.clone()),
            ));
            incident.root_cause = Some(root_cause);
        }

        if changes.description.is_some() {
            incident.description = changes.description;
        }
        if changes.assigned_team.is_some() {
            incident.assigned_team = changes.assigned_team;
        }
        if changes.resolution.is_some() {
            incident.resolution = changes.resolution;
        }
        if changes.impact_summary.is_some() {
            incident.impact_summary = changes.impact_summary;
        }
        if changes.customers_affected.is_some() {
            incident.customers_affected = changes.customers_affected;
        }
        if let Some(services) = changes.affected_services {
            incident.affected_services = services;
        }
        if let Some(tags) = changes.tags {
            incident.tags = tags;
        }

        incident.updated_at = now;
        write_back(&tx, &incident)?;
        for e in &entries {
            append_timeline(&tx, e)?;
        }
        tx.commit()?;

        debug!(incident = %incident.incident_number, entries = entries.len(), "incident updated");
        Ok(incident)
    }

    pub fn update_status(
        &self,
        id: Uuid,
        status: IncidentStatus,
        actor: &Actor,
        comment: Option<String>,
    ) -> Result<Incident> {
        self.update_status_at(id, status, actor, comment, db_now())
    }

    /// Move an incident to `status` as of `now`.
    ///
    /// The first entry into ACKNOWLEDGED, IDENTIFIED, MITIGATING, RESOLVED or
    /// CLOSED stamps its milestone; re-entry leaves the stamp and any derived
    /// duration untouched. Always appends exactly one STATUS_CHANGED entry.
    pub fn update_status_at(
        &self,
        id: Uuid,
        status: IncidentStatus,
        actor: &Actor,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Incident> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut incident = fetch(&tx, id)?;
        let previous = incident.status;

        if !self.policy.allows(previous, status) {
            return Err(StorageError::InvalidTransition {
                from: previous.to_string(),
                to: status.to_string(),
            });
        }

        incident.status = status;
        incident.updated_at = now;
        let minutes_open = (now - incident.created_at).num_minutes();
        match status {
            IncidentStatus::Acknowledged if incident.acknowledged_at.is_none() => {
                incident.acknowledged_at = Some(now);
                incident.time_to_acknowledge_minutes = Some(minutes_open);
            }
            IncidentStatus::Identified if incident.identified_at.is_none() => {
                incident.identified_at = Some(now);
            }
            IncidentStatus::Mitigating if incident.mitigated_at.is_none() => {
                incident.mitigated_at = Some(now);
            }
            IncidentStatus::Resolved if incident.resolved_at.is_none() => {
                incident.resolved_at = Some(now);
                incident.time_to_resolve_minutes = Some(minutes_open);
            }
            IncidentStatus::Closed if incident.closed_at.is_none() => {
                incident.closed_at = Some(now);
            }
            _ => {}
        }

        let message =
            comment.unwrap_or_else(|| format!("Status changed from {previous} to {status}"));
        let entry = TimelineEntry::new(id, TimelineEntryType::StatusChanged, message, actor, now)
            .with_change(Some(previous.to_string()), Some(status.to_string()));

        write_back(&tx, &incident)?;
        append_timeline(&tx, &entry)?;
        tx.commit()?;

        info!(incident = %incident.incident_number, from = %previous, to = %status, "incident status changed");
        self.notifier
            .dispatch(IncidentEvent::status_changed(&incident, previous));
        Ok(incident)
    }

    pub fn add_comment(&self, id: Uuid, comment: &str, actor: &Actor) -> Result<TimelineEntry> {
        if comment.trim().is_empty() {
            return Err(StorageError::Invalid("comment must not be empty".into()));
        }
        let conn = self.pool.get()?;
        fetch(&conn, id)?;
        let entry = TimelineEntry::new(id, TimelineEntryType::Comment, comment, actor, db_now());
        append_timeline(&conn, &entry)?;
        Ok(entry)
    }

    /// Timeline in insertion order.
    pub fn timeline(&self, id: Uuid) -> Result<Vec<TimelineEntry>> {
        let conn = self.pool.get()?;
        fetch(&conn, id)?;
        let mut stmt = conn.prepare(
            "SELECT id, incident_id, entry_type, message, old_value, new_value, user_id,
                    user_name, is_automated, created_at
             FROM incident_timeline WHERE incident_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![id.to_string()], timeline_from_row)?;
        let mut entries = Vec::new();
        for e in rows {
            entries.push(e?);
        }
        Ok(entries)
    }

    /// Link an anomaly to an incident and record it on the incident timeline,
    /// noting any incident it was previously linked to.
    pub fn link_anomaly(&self, incident_id: Uuid, anomaly_id: Uuid, actor: &Actor) -> Result<Anomaly> {
        let now = db_now();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        fetch(&tx, incident_id)?;
        let previous = recorder::set_incident_link(&tx, anomaly_id, incident_id)?;

        let message = match previous {
            Some(old) if old != incident_id => format!("Anomaly {anomaly_id} re-linked from incident {old}"),
            _ => format!("Anomaly {anomaly_id} linked"),
        };
        let entry = TimelineEntry::new(incident_id, TimelineEntryType::AnomalyLinked, message, actor, now)
            .with_change(previous.map(|p| p.to_string()), Some(incident_id.to_string()));
        append_timeline(&tx, &entry)?;
        let anomaly = recorder::fetch(&tx, anomaly_id)?;
        tx.commit()?;
        Ok(anomaly)
    }

    pub fn stats(&self) -> Result<IncidentStats> {
        self.stats_at(db_now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> Result<IncidentStats> {
        let conn = self.pool.get()?;
        let mut stats = IncidentStats::default();

        let mut stmt = conn.prepare(&format!(
            "SELECT severity, COUNT(*) FROM incidents WHERE {ACTIVE} GROUP BY severity"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                parse_enum::<IncidentSeverity>(0, &row.get::<_, String>(0)?)?,
                row.get::<_, i64>(1)?,
            ))
        })?;
        for row in rows {
            let (severity, count) = row?;
            let count = count.max(0) as u64;
            stats.open_count += count;
            stats.by_severity.insert(severity, count);
        }

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM incidents GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                parse_enum::<IncidentStatus>(0, &row.get::<_, String>(0)?)?,
                row.get::<_, i64>(1)?,
            ))
        })?;
        for row in rows {
            let (status, count) = row?;
            stats.by_status.insert(status, count.max(0) as u64);
        }

        let since = to_db_time(&(now - Duration::days(STATS_WINDOW_DAYS)));
        let (tta, ttr): (Option<f64>, Option<f64>) = conn.query_row(
            "SELECT AVG(time_to_acknowledge_minutes), AVG(time_to_resolve_minutes)
             FROM incidents WHERE created_at >= ?1",
            params![since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.avg_time_to_acknowledge_minutes = tta;
        stats.avg_time_to_resolve_minutes = ttr;

        Ok(stats)
    }

    fn query(&self, clause: &str, args: impl rusqlite::Params) -> Result<Vec<Incident>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM incidents {clause}"))?;
        let rows = stmt.query_map(args, from_row)?;
        let mut incidents = Vec::new();
        for i in rows {
            incidents.push(i?);
        }
        Ok(incidents)
    }
}
