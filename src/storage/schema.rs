//! Database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS metric_samples (
            id INTEGER PRIMARY KEY,
            application_id TEXT NOT NULL,
            metric_type TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            value REAL NOT NULL,
            host TEXT,
            environment TEXT,
            recorded_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_samples_key_time
            ON metric_samples(application_id, metric_type, recorded_at);

        CREATE TABLE IF NOT EXISTS threshold_configs (
            id TEXT PRIMARY KEY,
            application_id TEXT,
            metric_type TEXT NOT NULL,
            metric_name TEXT,
            warning_threshold REAL,
            critical_threshold REAL,
            min_threshold REAL,
            max_threshold REAL,
            z_score_threshold REAL NOT NULL,
            moving_avg_window_minutes INTEGER NOT NULL,
            deviation_percentage_threshold REAL NOT NULL,
            min_samples_required INTEGER NOT NULL,
            cooldown_minutes INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_threshold_scope
            ON threshold_configs(COALESCE(application_id, ''), metric_type);

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            incident_number TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            description TEXT,
            severity TEXT NOT NULL,
            priority TEXT NOT NULL,
            status TEXT NOT NULL,
            application_id TEXT,
            application_name TEXT,
            environment TEXT,
            affected_services TEXT NOT NULL DEFAULT '[]',
            assigned_to TEXT,
            assigned_team TEXT,
            reporter_id TEXT,
            root_cause TEXT,
            resolution TEXT,
            impact_summary TEXT,
            customers_affected INTEGER,
            auto_created INTEGER NOT NULL DEFAULT 0,
            triggering_anomaly_id TEXT,
            acknowledged_at TEXT,
            identified_at TEXT,
            mitigated_at TEXT,
            resolved_at TEXT,
            closed_at TEXT,
            time_to_acknowledge_minutes INTEGER,
            time_to_resolve_minutes INTEGER,
            tags TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_trigger
            ON incidents(triggering_anomaly_id) WHERE triggering_anomaly_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_incidents_status ON incidents(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_created ON incidents(created_at);

        CREATE TABLE IF NOT EXISTS anomalies (
            id TEXT PRIMARY KEY,
            application_id TEXT NOT NULL,
            application_name TEXT,
            metric_type TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            detection_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL,
            current_value REAL NOT NULL,
            expected_value REAL,
            threshold_value REAL,
            deviation_percentage REAL,
            z_score REAL,
            description TEXT NOT NULL,
            host TEXT,
            environment TEXT,
            detected_at TEXT NOT NULL,
            resolved_at TEXT,
            incident_id TEXT REFERENCES incidents(id) ON DELETE SET NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_anomalies_cooldown
            ON anomalies(application_id, metric_type, status, detected_at);
        CREATE INDEX IF NOT EXISTS idx_anomalies_detected ON anomalies(detected_at);

        CREATE TABLE IF NOT EXISTS incident_timeline (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            incident_id TEXT NOT NULL REFERENCES incidents(id) ON DELETE CASCADE,
            entry_type TEXT NOT NULL,
            message TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT,
            user_id TEXT,
            user_name TEXT,
            is_automated INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_timeline_incident ON incident_timeline(incident_id, seq);

        CREATE TABLE IF NOT EXISTS counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}
