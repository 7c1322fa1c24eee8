//! Human-readable incident numbers (`INC-000042`).
//!
//! Numbers come from a persisted counter bumped with a single upsert, so two
//! writers can never observe the same value. Callers run it inside the
//! transaction that inserts the incident; a rollback returns the number.

use rusqlite::{params, Connection};

const INCIDENT_COUNTER: &str = "incident_number";

pub fn format_number(n: i64) -> String {
    format!("INC-{n:06}")
}

pub fn next_incident_number(conn: &Connection) -> rusqlite::Result<String> {
    let value: i64 = conn.query_row(
        "INSERT INTO counters (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1
         RETURNING value",
        params![INCIDENT_COUNTER],
        |row| row.get(0),
    )?;
    Ok(format_number(value))
}
