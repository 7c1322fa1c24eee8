//! Per-(application, metric type) detection configuration.
//!
//! Lookups prefer an enabled application-specific row, then the global row,
//! and finally synthesize a global default from the metric type's seeds. The
//! synthesized row is persisted with a get-or-create guarded by the unique
//! scope index, so concurrent first lookups converge on one row.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DetectionConfig;
use crate::metrics::MetricType;
use crate::storage::{
    db_now, parse_enum, parse_time, parse_uuid, parse_uuid_opt, to_db_time, Pool, Result,
    StorageError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub id: Uuid,
    /// `None` marks the global configuration for the metric type.
    pub application_id: Option<Uuid>,
    pub metric_type: MetricType,
    pub metric_name: Option<String>,
    pub warning_threshold: Option<f64>,
    pub critical_threshold: Option<f64>,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub z_score_threshold: f64,
    pub moving_avg_window_minutes: u32,
    pub deviation_percentage_threshold: f64,
    pub min_samples_required: u32,
    pub cooldown_minutes: u32,
    pub enabled: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThresholdConfig {
    /// Default configuration for a metric type, using the type's seed bounds.
    pub fn synthesized(
        application_id: Option<Uuid>,
        metric_type: MetricType,
        seeds: &DetectionConfig,
    ) -> Self {
        let now = db_now();
        let (warning, critical) = metric_type.default_bounds().unzip();
        Self {
            id: Uuid::new_v4(),
            application_id,
            metric_type,
            metric_name: None,
            warning_threshold: warning,
            critical_threshold: critical,
            min_threshold: None,
            max_threshold: None,
            z_score_threshold: seeds.z_score_threshold,
            moving_avg_window_minutes: seeds.moving_avg_window_minutes,
            deviation_percentage_threshold: seeds.deviation_percentage_threshold,
            min_samples_required: seeds.min_samples_required,
            cooldown_minutes: seeds.cooldown_minutes,
            enabled: true,
            description: Some(format!("Auto-generated default config for {metric_type}")),
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(&mut self, req: &ThresholdRequest) {
        self.metric_name = req.metric_name.clone();
        self.warning_threshold = req.warning_threshold;
        self.critical_threshold = req.critical_threshold;
        self.min_threshold = req.min_threshold;
        self.max_threshold = req.max_threshold;
        if let Some(z) = req.z_score_threshold {
            self.z_score_threshold = z;
        }
        if let Some(w) = req.moving_avg_window_minutes {
            self.moving_avg_window_minutes = w;
        }
        if let Some(d) = req.deviation_percentage_threshold {
            self.deviation_percentage_threshold = d;
        }
        if let Some(m) = req.min_samples_required {
            self.min_samples_required = m;
        }
        if let Some(c) = req.cooldown_minutes {
            self.cooldown_minutes = c;
        }
        if let Some(e) = req.enabled {
            self.enabled = e;
        }
        if req.description.is_some() {
            self.description = req.description.clone();
        }
    }

    fn validate(&self) -> Result<()> {
        let bounds = [
            self.warning_threshold,
            self.critical_threshold,
            self.min_threshold,
            self.max_threshold,
        ];
        if bounds.iter().flatten().any(|b| !b.is_finite()) {
            return Err(StorageError::Invalid("threshold bounds must be finite".into()));
        }
        if !(self.z_score_threshold.is_finite() && self.z_score_threshold > 0.0) {
            return Err(StorageError::Invalid("z_score_threshold must be positive".into()));
        }
        if !(self.deviation_percentage_threshold.is_finite()
            && self.deviation_percentage_threshold > 0.0)
        {
            return Err(StorageError::Invalid(
                "deviation_percentage_threshold must be positive".into(),
            ));
        }
        if self.moving_avg_window_minutes == 0 {
            return Err(StorageError::Invalid("moving_avg_window_minutes must be at least 1".into()));
        }
        Ok(())
    }
}

/// Operator input for creating or replacing a configuration. Bounds are taken
/// as given (`None` clears them); unset tunables keep their current or seed
/// value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRequest {
    #[serde(default)]
    pub application_id: Option<Uuid>,
    pub metric_type: MetricType,
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    #[serde(default)]
    pub critical_threshold: Option<f64>,
    #[serde(default)]
    pub min_threshold: Option<f64>,
    #[serde(default)]
    pub max_threshold: Option<f64>,
    #[serde(default)]
    pub z_score_threshold: Option<f64>,
    #[serde(default)]
    pub moving_avg_window_minutes: Option<u32>,
    #[serde(default)]
    pub deviation_percentage_threshold: Option<f64>,
    #[serde(default)]
    pub min_samples_required: Option<u32>,
    #[serde(default)]
    pub cooldown_minutes: Option<u32>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ThresholdRequest {
    pub fn new(application_id: Option<Uuid>, metric_type: MetricType) -> Self {
        Self {
            application_id,
            metric_type,
            metric_name: None,
            warning_threshold: None,
            critical_threshold: None,
            min_threshold: None,
            max_threshold: None,
            z_score_threshold: None,
            moving_avg_window_minutes: None,
            deviation_percentage_threshold: None,
            min_samples_required: None,
            cooldown_minutes: None,
            enabled: None,
            description: None,
        }
    }
}

const COLUMNS: &str = "id, application_id, metric_type, metric_name, warning_threshold,
    critical_threshold, min_threshold, max_threshold, z_score_threshold,
    moving_avg_window_minutes, deviation_percentage_threshold, min_samples_required,
    cooldown_minutes, enabled, description, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<ThresholdConfig> {
    Ok(ThresholdConfig {
        id: parse_uuid(0, &row.get::<_, String>(0)?)?,
        application_id: parse_uuid_opt(1, row.get(1)?)?,
        metric_type: parse_enum(2, &row.get::<_, String>(2)?)?,
        metric_name: row.get(3)?,
        warning_threshold: row.get(4)?,
        critical_threshold: row.get(5)?,
        min_threshold: row.get(6)?,
        max_threshold: row.get(7)?,
        z_score_threshold: row.get(8)?,
        moving_avg_window_minutes: row.get(9)?,
        deviation_percentage_threshold: row.get(10)?,
        min_samples_required: row.get(11)?,
        cooldown_minutes: row.get(12)?,
        enabled: row.get(13)?,
        description: row.get(14)?,
        created_at: parse_time(15, &row.get::<_, String>(15)?)?,
        updated_at: parse_time(16, &row.get::<_, String>(16)?)?,
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Persistent threshold configurations plus the resolution policy.
#[derive(Clone)]
pub struct ThresholdStore {
    pool: Pool,
    seeds: DetectionConfig,
}

impl ThresholdStore {
    pub fn new(pool: Pool, seeds: DetectionConfig) -> Self {
        Self { pool, seeds }
    }

    /// Resolve the configuration governing samples of `metric_type` from
    /// `application_id`. May return a disabled global row; callers skip
    /// evaluation in that case.
    pub fn resolve(&self, application_id: Uuid, metric_type: MetricType) -> Result<ThresholdConfig> {
        let conn = self.pool.get()?;

        let specific = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM threshold_configs
                     WHERE application_id = ?1 AND metric_type = ?2 AND enabled = 1"
                ),
                params![application_id.to_string(), metric_type.as_str()],
                from_row,
            )
            .optional()?;
        if let Some(cfg) = specific {
            return Ok(cfg);
        }

        let global = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM threshold_configs
                     WHERE application_id IS NULL AND metric_type = ?1"
                ),
                params![metric_type.as_str()],
                from_row,
            )
            .optional()?;
        if let Some(cfg) = global {
            return Ok(cfg);
        }

        drop(conn);
        self.get_or_create_default(metric_type)
    }

    /// Idempotently persist the synthesized global default for `metric_type`.
    pub fn get_or_create_default(&self, metric_type: MetricType) -> Result<ThresholdConfig> {
        let conn = self.pool.get()?;
        let cfg = ThresholdConfig::synthesized(None, metric_type, &self.seeds);
        let inserted = insert(&conn, &cfg, true)?;
        if inserted {
            info!(%metric_type, "synthesized default threshold configuration");
        }

        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM threshold_configs
                 WHERE application_id IS NULL AND metric_type = ?1"
            ),
            params![metric_type.as_str()],
            from_row,
        )
        .map_err(StorageError::from)
    }

    /// Persist a default global configuration for every metric type that does
    /// not have one yet.
    pub fn seed_defaults(&self) -> Result<Vec<ThresholdConfig>> {
        MetricType::ALL
            .iter()
            .map(|t| self.get_or_create_default(*t))
            .collect()
    }

    pub fn create(&self, req: &ThresholdRequest) -> Result<ThresholdConfig> {
        let mut cfg = ThresholdConfig::synthesized(req.application_id, req.metric_type, &self.seeds);
        cfg.description = None;
        cfg.apply(req);
        cfg.validate()?;

        let conn = self.pool.get()?;
        match insert(&conn, &cfg, false) {
            Ok(_) => {
                debug!(id = %cfg.id, metric_type = %cfg.metric_type, "threshold configuration created");
                Ok(cfg)
            }
            Err(e) if is_constraint_violation(&e) => Err(StorageError::Conflict(format!(
                "threshold configuration already exists for {} / {}",
                req.application_id
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "global".to_string()),
                req.metric_type
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, id: Uuid) -> Result<ThresholdConfig> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM threshold_configs WHERE id = ?1"),
            params![id.to_string()],
            from_row,
        )
        .optional()?
        .ok_or_else(|| StorageError::not_found("threshold configuration", id))
    }

    pub fn list_for_application(&self, application_id: Uuid) -> Result<Vec<ThresholdConfig>> {
        self.query(
            "WHERE application_id = ?1 ORDER BY metric_type",
            params![application_id.to_string()],
        )
    }

    pub fn list_global(&self) -> Result<Vec<ThresholdConfig>> {
        self.query("WHERE application_id IS NULL ORDER BY metric_type", params![])
    }

    pub fn list_enabled(&self) -> Result<Vec<ThresholdConfig>> {
        self.query(
            "WHERE enabled = 1 ORDER BY COALESCE(application_id, ''), metric_type",
            params![],
        )
    }

    /// Replace the bounds and tunables of an existing configuration. The
    /// scope (application, metric type) never changes.
    pub fn update(&self, id: Uuid, req: &ThresholdRequest) -> Result<ThresholdConfig> {
        let mut cfg = self.get(id)?;
        cfg.apply(req);
        cfg.validate()?;
        cfg.updated_at = db_now();

        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE threshold_configs SET metric_name = ?2, warning_threshold = ?3,
                critical_threshold = ?4, min_threshold = ?5, max_threshold = ?6,
                z_score_threshold = ?7, moving_avg_window_minutes = ?8,
                deviation_percentage_threshold = ?9, min_samples_required = ?10,
                cooldown_minutes = ?11, enabled = ?12, description = ?13, updated_at = ?14
             WHERE id = ?1",
            params![
                cfg.id.to_string(),
                cfg.metric_name,
                cfg.warning_threshold,
                cfg.critical_threshold,
                cfg.min_threshold,
                cfg.max_threshold,
                cfg.z_score_threshold,
                cfg.moving_avg_window_minutes,
                cfg.deviation_percentage_threshold,
                cfg.min_samples_required,
                cfg.cooldown_minutes,
                cfg.enabled,
                cfg.description,
                to_db_time(&cfg.updated_at),
            ],
        )?;
        Ok(cfg)
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<ThresholdConfig> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE threshold_configs SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), enabled, to_db_time(&db_now())],
        )?;
        if changed == 0 {
            return Err(StorageError::not_found("threshold configuration", id));
        }
        drop(conn);
        self.get(id)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM threshold_configs WHERE id = ?1",
            params![id.to_string()],
        )?;
        if removed == 0 {
            return Err(StorageError::not_found("threshold configuration", id));
        }
        Ok(())
    }

    fn query(&self, clause: &str, args: impl rusqlite::Params) -> Result<Vec<ThresholdConfig>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM threshold_configs {clause}"))?;
        let rows = stmt.query_map(args, from_row)?;
        let mut configs = Vec::new();
        for cfg in rows {
            configs.push(cfg?);
        }
        Ok(configs)
    }
}

/// Insert a row. With `ignore_conflict` a row for an existing scope is
/// silently skipped. Returns whether a row was written.
fn insert(conn: &rusqlite::Connection, cfg: &ThresholdConfig, ignore_conflict: bool) -> rusqlite::Result<bool> {
    let conflict = if ignore_conflict { "ON CONFLICT DO NOTHING" } else { "" };
    let written = conn.execute(
        &format!(
            "INSERT INTO threshold_configs ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             {conflict}"
        ),
        params![
            cfg.id.to_string(),
            cfg.application_id.map(|a| a.to_string()),
            cfg.metric_type.as_str(),
            cfg.metric_name,
            cfg.warning_threshold,
            cfg.critical_threshold,
            cfg.min_threshold,
            cfg.max_threshold,
            cfg.z_score_threshold,
            cfg.moving_avg_window_minutes,
            cfg.deviation_percentage_threshold,
            cfg.min_samples_required,
            cfg.cooldown_minutes,
            cfg.enabled,
            cfg.description,
            to_db_time(&cfg.created_at),
            to_db_time(&cfg.updated_at),
        ],
    )?;
    Ok(written > 0)
}
