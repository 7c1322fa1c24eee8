//! Incident lifecycle: models, numbering, escalation from anomalies, and the
//! status state machine.

pub mod escalation;
pub mod manager;
pub mod numbering;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::UnknownVariant;
use crate::storage::{
    parse_enum, parse_string_list, parse_time, parse_time_opt, parse_uuid, parse_uuid_opt,
    to_db_time, to_db_time_opt, Result, StorageError,
};

pub use self::escalation::EscalationMapper;
pub use self::manager::IncidentManager;

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().eq_ignore_ascii_case(s))
                    .ok_or_else(|| UnknownVariant::new($kind, s))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentSeverity {
    Sev1,
    Sev2,
    Sev3,
    Sev4,
    Sev5,
}

text_enum!(IncidentSeverity, "incident severity", {
    Sev1 => "SEV1",
    Sev2 => "SEV2",
    Sev3 => "SEV3",
    Sev4 => "SEV4",
    Sev5 => "SEV5",
});

impl IncidentSeverity {
    /// One-to-one priority for a severity.
    pub fn priority(&self) -> Priority {
        match self {
            IncidentSeverity::Sev1 => Priority::P1,
            IncidentSeverity::Sev2 => Priority::P2,
            IncidentSeverity::Sev3 => Priority::P3,
            IncidentSeverity::Sev4 => Priority::P4,
            IncidentSeverity::Sev5 => Priority::P5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
    P5,
}

text_enum!(Priority, "priority", {
    P1 => "P1",
    P2 => "P2",
    P3 => "P3",
    P4 => "P4",
    P5 => "P5",
});

/// Incident states in their intended order of progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Investigating,
    Identified,
    Mitigating,
    Monitoring,
    Resolved,
    Closed,
}

text_enum!(IncidentStatus, "incident status", {
    Open => "OPEN",
    Acknowledged => "ACKNOWLEDGED",
    Investigating => "INVESTIGATING",
    Identified => "IDENTIFIED",
    Mitigating => "MITIGATING",
    Monitoring => "MONITORING",
    Resolved => "RESOLVED",
    Closed => "CLOSED",
});

impl IncidentStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, IncidentStatus::Resolved | IncidentStatus::Closed)
    }
}

/// Which status changes `update_status` accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionPolicy {
    /// Any state may be set from any state.
    #[default]
    Permissive,
    /// Forward moves along the progression, reopen to INVESTIGATING from
    /// MONITORING or RESOLVED, nothing out of CLOSED, no self-transitions.
    Strict,
}

impl TransitionPolicy {
    pub fn allows(&self, from: IncidentStatus, to: IncidentStatus) -> bool {
        match self {
            TransitionPolicy::Permissive => true,
            TransitionPolicy::Strict => match from {
                IncidentStatus::Closed => false,
                IncidentStatus::Monitoring | IncidentStatus::Resolved
                    if to == IncidentStatus::Investigating =>
                {
                    true
                }
                _ => to > from,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimelineEntryType {
    Created,
    StatusChanged,
    SeverityChanged,
    PriorityChanged,
    Assigned,
    Comment,
    AnomalyLinked,
    RootCauseIdentified,
}

text_enum!(TimelineEntryType, "timeline entry type", {
    Created => "CREATED",
    StatusChanged => "STATUS_CHANGED",
    SeverityChanged => "SEVERITY_CHANGED",
    PriorityChanged => "PRIORITY_CHANGED",
    Assigned => "ASSIGNED",
    Comment => "COMMENT",
    AnomalyLinked => "ANOMALY_LINKED",
    RootCauseIdentified => "ROOT_CAUSE_IDENTIFIED",
});

/// Who performed an incident action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    Automated,
    User { id: Uuid, name: Option<String> },
}

impl Actor {
    pub fn user(id: Uuid) -> Self {
        Actor::User { id, name: None }
    }

    /// A request-supplied user, or `Automated` when none was given.
    pub fn from_parts(user_id: Option<Uuid>, user_name: Option<String>) -> Self {
        match user_id {
            Some(id) => Actor::User { id, name: user_name },
            None => Actor::Automated,
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Actor::User { id, .. } => Some(*id),
            Actor::Automated => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub incident_number: String,
    pub title: String,
    pub description: Option<String>,
    pub severity: IncidentSeverity,
    pub priority: Priority,
    pub status: IncidentStatus,
    pub application_id: Option<Uuid>,
    pub application_name: Option<String>,
    pub environment: Option<String>,
    pub affected_services: Vec<String>,
    pub assigned_to: Option<Uuid>,
    pub assigned_team: Option<String>,
    pub reporter_id: Option<Uuid>,
    pub root_cause: Option<String>,
    pub resolution: Option<String>,
    pub impact_summary: Option<String>,
    pub customers_affected: Option<u32>,
    pub auto_created: bool,
    pub triggering_anomaly_id: Option<Uuid>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub identified_at: Option<DateTime<Utc>>,
    pub mitigated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub time_to_acknowledge_minutes: Option<i64>,
    pub time_to_resolve_minutes: Option<i64>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit record of one incident change or comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub entry_type: TimelineEntryType,
    pub message: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub user_id: Option<Uuid>,
    pub user_name: Option<String>,
    pub is_automated: bool,
    pub created_at: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(
        incident_id: Uuid,
        entry_type: TimelineEntryType,
        message: impl Into<String>,
        actor: &Actor,
        at: DateTime<Utc>,
    ) -> Self {
        let (user_id, user_name, is_automated) = match actor {
            Actor::Automated => (None, None, true),
            Actor::User { id, name } => (Some(*id), name.clone(), false),
        };
        Self {
            id: Uuid::new_v4(),
            incident_id,
            entry_type,
            message: message.into(),
            old_value: None,
            new_value: None,
            user_id,
            user_name,
            is_automated,
            created_at: at,
        }
    }

    pub fn with_change(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }
}

/// Operator input for a manually created incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIncident {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub severity: IncidentSeverity,
    /// Defaults to the severity's priority.
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub application_id: Option<Uuid>,
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub affected_services: Vec<String>,
    #[serde(default)]
    pub assigned_to: Option<Uuid>,
    #[serde(default)]
    pub assigned_team: Option<String>,
    #[serde(default)]
    pub impact_summary: Option<String>,
    #[serde(default)]
    pub customers_affected: Option<u32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewIncident {
    pub fn new(title: impl Into<String>, severity: IncidentSeverity) -> Self {
        Self {
            title: title.into(),
            description: None,
            severity,
            priority: None,
            application_id: None,
            application_name: None,
            environment: None,
            affected_services: Vec::new(),
            assigned_to: None,
            assigned_team: None,
            impact_summary: None,
            customers_affected: None,
            tags: Vec::new(),
        }
    }
}

/// Field edits. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<IncidentSeverity>,
    pub priority: Option<Priority>,
    pub assigned_to: Option<Uuid>,
    pub assigned_team: Option<String>,
    pub root_cause: Option<String>,
    pub resolution: Option<String>,
    pub impact_summary: Option<String>,
    pub customers_affected: Option<u32>,
    pub affected_services: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentStats {
    /// Incidents not yet RESOLVED or CLOSED.
    pub open_count: u64,
    pub by_severity: BTreeMap<IncidentSeverity, u64>,
    pub by_status: BTreeMap<IncidentStatus, u64>,
    /// Averages over incidents created in the last 30 days.
    pub avg_time_to_acknowledge_minutes: Option<f64>,
    pub avg_time_to_resolve_minutes: Option<f64>,
}

// ---------------------------------------------------------------------------
// Row codecs shared by the manager and the escalation mapper
// ---------------------------------------------------------------------------

pub(crate) const COLUMNS: &str = "id, incident_number, title, description, severity, priority,
    status, application_id, application_name, environment, affected_services, assigned_to,
    assigned_team, reporter_id, root_cause, resolution, impact_summary, customers_affected,
    auto_created, triggering_anomaly_id, acknowledged_at, identified_at, mitigated_at,
    resolved_at, closed_at, time_to_acknowledge_minutes, time_to_resolve_minutes, tags,
    created_at, updated_at";

pub(crate) const ACTIVE: &str = "status NOT IN ('RESOLVED', 'CLOSED')";

pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        incident_number: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        severity: parse_enum(4, &row.get::<_, String>(4)?)?,
        priority: parse_enum(5, &row.get::<_, String>(5)?)?,
        status: parse_enum(6, &row.get::<_, String>(6)?)?,
        application_id: parse_uuid_opt(7, row.get(7)?)?,
        application_name: row.get(8)?,
        environment: row.get(9)?,
        affected_services: parse_string_list(10, &row.get::<_, String>(10)?)?,
        assigned_to: parse_uuid_opt(11, row.get(11)?)?,
        assigned_team: row.get(12)?,
        reporter_id: parse_uuid_opt(13, row.get(13)?)?,
        root_cause: row.get(14)?,
        resolution: row.get(15)?,
        impact_summary: row.get(16)?,
        customers_affected: row.get(17)?,
        auto_created: row.get(18)?,
        triggering_anomaly_id: parse_uuid_opt(19, row.get(19)?)?,
        acknowledged_at: parse_time_opt(20, row.get(20)?)?,
        identified_at: parse_time_opt(21, row.get(21)?)?,
        mitigated_at: parse_time_opt(22, row.get(22)?)?,
        resolved_at: parse_time_opt(23, row.get(23)?)?,
        closed_at: parse_time_opt(24, row.get(24)?)?,
        time_to_acknowledge_minutes: row.get(25)?,
        time_to_resolve_minutes: row.get(26)?,
        tags: parse_string_list(27, &row.get::<_, String>(27)?)?,
        created_at: parse_time(28, &row.get::<_, String>(28)?)?,
        updated_at: parse_time(29, &row.get::<_, String>(29)?)?,
    })
}

/// Insert a new incident. A second incident for the same triggering anomaly
/// is skipped; returns whether the row was written.
pub(crate) fn insert(conn: &Connection, i: &Incident) -> Result<bool> {
    let written = conn.execute(
        &format!(
            "INSERT INTO incidents ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)
             ON CONFLICT(triggering_anomaly_id) WHERE triggering_anomaly_id IS NOT NULL
             DO NOTHING"
        ),
        params![
            i.id.to_string(),
            i.incident_number,
            i.title,
            i.description,
            i.severity.as_str(),
            i.priority.as_str(),
            i.status.as_str(),
            i.application_id.map(|a| a.to_string()),
            i.application_name,
            i.environment,
            serde_json::to_string(&i.affected_services)?,
            i.assigned_to.map(|a| a.to_string()),
            i.assigned_team,
            i.reporter_id.map(|r| r.to_string()),
            i.root_cause,
            i.resolution,
            i.impact_summary,
            i.customers_affected,
            i.auto_created,
            i.triggering_anomaly_id.map(|a| a.to_string()),
            to_db_time_opt(&i.acknowledged_at),
            to_db_time_opt(&i.identified_at),
            to_db_time_opt(&i.mitigated_at),
            to_db_time_opt(&i.resolved_at),
            to_db_time_opt(&i.closed_at),
            i.time_to_acknowledge_minutes,
            i.time_to_resolve_minutes,
            serde_json::to_string(&i.tags)?,
            to_db_time(&i.created_at),
            to_db_time(&i.updated_at),
        ],
    )?;
    Ok(written > 0)
}

/// Write back every mutable column of an existing incident.
pub(crate) fn write_back(conn: &Connection, i: &Incident) -> Result<()> {
    conn.execute(
        "UPDATE incidents SET title = ?2, description = ?3, severity = ?4, priority = ?5,
            status = ?6, environment = ?7, affected_services = ?8, assigned_to = ?9,
            assigned_team = ?10, root_cause = ?11, resolution = ?12, impact_summary = ?13,
            customers_affected = ?14, acknowledged_at = ?15, identified_at = ?16,
            mitigated_at = ?17, resolved_at = ?18, closed_at = ?19,
            time_to_acknowledge_minutes = ?20, time_to_resolve_minutes = ?21, tags = ?22,
            updated_at = ?23
         WHERE id = ?1",
        params![
            i.id.to_string(),
            i.title,
            i.description,
            i.severity.as_str(),
            i.priority.as_str(),
            i.status.as_str(),
            i.environment,
            serde_json::to_string(&i.affected_services)?,
            i.assigned_to.map(|a| a.to_string()),
            i.assigned_team,
            i.root_cause,
            i.resolution,
            i.impact_summary,
            i.customers_affected,
            to_db_time_opt(&i.acknowledged_at),
            to_db_time_opt(&i.identified_at),
            to_db_time_opt(&i.mitigated_at),
            to_db_time_opt(&i.resolved_at),
            to_db_time_opt(&i.closed_at),
            i.time_to_acknowledge_minutes,
            i.time_to_resolve_minutes,
            serde_json::to_string(&i.tags)?,
            to_db_time(&i.updated_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn fetch(conn: &Connection, id: Uuid) -> Result<Incident> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM incidents WHERE id = ?1"),
        params![id.to_string()],
        from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("incident", id))
}

pub(crate) fn exists_for_anomaly(conn: &Connection, anomaly_id: Uuid) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM incidents WHERE triggering_anomaly_id = ?1)",
        params![anomaly_id.to_string()],
        |row| row.get(0),
    )
}

pub(crate) fn append_timeline(conn: &Connection, e: &TimelineEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO incident_timeline (id, incident_id, entry_type, message, old_value,
            new_value, user_id, user_name, is_automated, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            e.id.to_string(),
            e.incident_id.to_string(),
            e.entry_type.as_str(),
            e.message,
            e.old_value,
            e.new_value,
            e.user_id.map(|u| u.to_string()),
            e.user_name,
            e.is_automated,
            to_db_time(&e.created_at),
        ],
    )?;
    Ok(())
}

pub(crate) fn timeline_from_row(row: &Row<'_>) -> rusqlite::Result<TimelineEntry> {
    Ok(TimelineEntry {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        incident_id: parse_uuid(1, &row.get::<_, String>(1)?)?,
        entry_type: parse_enum(2, &row.get::<_, String>(2)?)?,
        message: row.get(3)?,
        old_value: row.get(4)?,
        new_value: row.get(5)?,
        user_id: parse_uuid_opt(6, row.get(6)?)?,
        user_name: row.get(7)?,
        is_automated: row.get(8)?,
        created_at: parse_time(9, &row.get::<_, String>(9)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_maps_to_matching_priority() {
        assert_eq!(IncidentSeverity::Sev1.priority(), Priority::P1);
        assert_eq!(IncidentSeverity::Sev5.priority(), Priority::P5);
        assert_eq!(serde_json::to_string(&IncidentSeverity::Sev2).unwrap(), "\"SEV2\"");
        assert_eq!("p3".parse::<Priority>().unwrap(), Priority::P3);
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&IncidentStatus::Acknowledged).unwrap(),
            "\"ACKNOWLEDGED\""
        );
        for status in IncidentStatus::ALL {
            assert_eq!(status.as_str().parse::<IncidentStatus>().unwrap(), *status);
        }
        assert!(!IncidentStatus::Closed.is_active());
        assert!(IncidentStatus::Monitoring.is_active());
    }

    #[test]
    fn test_permissive_policy_allows_everything() {
        let policy = TransitionPolicy::Permissive;
        for from in IncidentStatus::ALL {
            for to in IncidentStatus::ALL {
                assert!(policy.allows(*from, *to));
            }
        }
    }

    #[test]
    fn test_strict_policy_table() {
        use IncidentStatus::*;
        let policy = TransitionPolicy::Strict;
        assert!(policy.allows(Open, Acknowledged));
        assert!(policy.allows(Open, Resolved));
        assert!(policy.allows(Resolved, Closed));
        assert!(policy.allows(Resolved, Investigating));
        assert!(policy.allows(Monitoring, Investigating));
        assert!(!policy.allows(Acknowledged, Open));
        assert!(!policy.allows(Investigating, Investigating));
        assert!(!policy.allows(Closed, Open));
        assert!(!policy.allows(Closed, Investigating));
    }

    #[test]
    fn test_actor_from_parts() {
        let id = Uuid::new_v4();
        assert_eq!(Actor::from_parts(None, Some("x".into())), Actor::Automated);
        assert_eq!(Actor::from_parts(Some(id), None).user_id(), Some(id));
    }
}
