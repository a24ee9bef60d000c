use crate::db::now_ms;
use crate::missions::set_run_status;
use crate::realtime::LogBus;
use crate::schema::RunStatus;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound progress report from the worker. Only `run_id` is required;
/// every other field carries a default.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default)]
    pub run_id: String,
    pub message: Option<String>,
    pub status: Option<String>,
    pub details: Option<Value>,
    pub role: Option<String>,
    pub action: Option<String>,
    pub step_id: Option<i64>,
    pub selector: Option<String>,
    pub value: Option<String>,
    pub screenshot_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogRecord {
    pub id: i64,
    pub run_id: String,
    pub step_id: i64,
    pub role: String,
    pub action: String,
    pub status: String,
    pub message: String,
    pub details: Option<String>,
    pub selector: Option<String>,
    pub value: Option<String>,
    pub screenshot_url: Option<String>,
    pub created_at_ms: i64,
}

/// Append one execution-log row and, when the reported status is terminal,
/// flip the run row to match. Log rows are never updated; the audit trail
/// is append-only.
pub fn ingest(
    connection: &Connection,
    bus: &LogBus,
    payload: &TelemetryPayload,
) -> Result<ExecutionLogRecord, String> {
    let run_id = payload.run_id.trim();
    if run_id.is_empty() {
        return Err("Missing run_id".to_string());
    }

    let now = now_ms();
    let message = payload
        .message
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("No message provided");
    let status = payload
        .status
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("INFO");
    let role = payload.role.as_deref().unwrap_or("assistant");
    let action = payload.action.as_deref().unwrap_or("log");
    // Worker omissions fall back to a time-derived step number so ordering
    // stays monotonic within the run.
    let step_id = payload.step_id.unwrap_or(now / 1000);
    let details = payload.details.as_ref().map(|value| match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    });

    connection
        .execute(
            "INSERT INTO execution_logs (
               run_id, step_id, role, action, status, message, details,
               selector, value, screenshot_url, created_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run_id,
                step_id,
                role,
                action,
                status,
                message,
                details,
                payload.selector,
                payload.value,
                payload.screenshot_url,
                now
            ],
        )
        .map_err(|e| format!("Log insertion failed: {e}"))?;
    let row_id = connection.last_insert_rowid();

    if let Ok(parsed) = RunStatus::parse(status) {
        if parsed.is_terminal() {
            // Last write wins; repeated terminal reports are tolerated.
            if let Err(update_err) = set_run_status(connection, run_id, parsed) {
                tracing::warn!("telemetry status update failed: {update_err}");
            }
        }
    }

    let record = ExecutionLogRecord {
        id: row_id,
        run_id: run_id.to_string(),
        step_id,
        role: role.to_string(),
        action: action.to_string(),
        status: status.to_string(),
        message: message.to_string(),
        details,
        selector: payload.selector.clone(),
        value: payload.value.clone(),
        screenshot_url: payload.screenshot_url.clone(),
        created_at_ms: now,
    };
    bus.publish(&record);
    Ok(record)
}

pub fn fetch_logs(
    connection: &Connection,
    run_id: &str,
) -> Result<Vec<ExecutionLogRecord>, String> {
    let mut stmt = connection
        .prepare(
            "SELECT id, run_id, step_id, role, action, status, message, details,
                    selector, value, screenshot_url, created_at_ms
             FROM execution_logs
             WHERE run_id = ?1
             ORDER BY step_id ASC, id ASC",
        )
        .map_err(|e| format!("Failed to prepare log query: {e}"))?;
    let rows = stmt
        .query_map(params![run_id], map_log_row)
        .map_err(|e| format!("Failed to query logs: {e}"))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| format!("Failed to parse log row: {e}"))?);
    }
    Ok(out)
}

fn map_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionLogRecord> {
    Ok(ExecutionLogRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        role: row.get(3)?,
        action: row.get(4)?,
        status: row.get(5)?,
        message: row.get(6)?,
        details: row.get(7)?,
        selector: row.get(8)?,
        value: row.get(9)?,
        screenshot_url: row.get(10)?,
        created_at_ms: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap_schema;
    use crate::missions::create_run;
    use crate::schema::RunMode;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open");
        bootstrap_schema(&mut conn).expect("bootstrap");
        conn
    }

    fn queued_run(conn: &Connection) -> String {
        create_run(conn, "user_1", "https://shop.test", "check login", RunMode::Sniper)
            .expect("run")
            .id
    }

    fn payload(run_id: &str) -> TelemetryPayload {
        TelemetryPayload {
            run_id: run_id.to_string(),
            message: None,
            status: None,
            details: None,
            role: None,
            action: None,
            step_id: None,
            selector: None,
            value: None,
            screenshot_url: None,
        }
    }

    #[test]
    fn missing_run_id_is_rejected_before_any_insert() {
        let conn = test_conn();
        let bus = LogBus::new();
        let err = ingest(&conn, &bus, &payload("  ")).expect_err("missing run_id");
        assert_eq!(err, "Missing run_id");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM execution_logs", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn defaults_fill_omitted_fields() {
        let conn = test_conn();
        let bus = LogBus::new();
        let run_id = queued_run(&conn);
        let record = ingest(&conn, &bus, &payload(&run_id)).expect("ingest");
        assert_eq!(record.status, "INFO");
        assert_eq!(record.role, "assistant");
        assert_eq!(record.action, "log");
        assert_eq!(record.message, "No message provided");
        assert!(record.step_id > 0);
    }

    #[test]
    fn each_call_appends_exactly_one_row() {
        let conn = test_conn();
        let bus = LogBus::new();
        let run_id = queued_run(&conn);
        for step in 1..=4 {
            let mut body = payload(&run_id);
            body.step_id = Some(step);
            body.message = Some(format!("step {step}"));
            ingest(&conn, &bus, &body).expect("ingest");
        }
        let logs = fetch_logs(&conn, &run_id).expect("fetch");
        assert_eq!(logs.len(), 4);
        assert_eq!(
            logs.iter().map(|l| l.step_id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn terminal_status_flips_the_run_exactly_once_logged() {
        let conn = test_conn();
        let bus = LogBus::new();
        let run_id = queued_run(&conn);

        let mut running = payload(&run_id);
        running.status = Some("RUNNING".to_string());
        ingest(&conn, &bus, &running).expect("running log");
        let status: String = conn
            .query_row("SELECT status FROM test_runs WHERE id = ?1", params![run_id], |r| {
                r.get(0)
            })
            .expect("status");
        assert_eq!(status, "QUEUED");

        let mut failed = payload(&run_id);
        failed.status = Some("FAILED".to_string());
        ingest(&conn, &bus, &failed).expect("failed log");
        let status: String = conn
            .query_row("SELECT status FROM test_runs WHERE id = ?1", params![run_id], |r| {
                r.get(0)
            })
            .expect("status");
        assert_eq!(status, "FAILED");

        let logs = fetch_logs(&conn, &run_id).expect("fetch");
        assert_eq!(logs.len(), 2);
    }

    #[test]
    fn repeated_terminal_calls_are_last_write_wins() {
        let conn = test_conn();
        let bus = LogBus::new();
        let run_id = queued_run(&conn);

        for status in ["FAILED", "COMPLETED"] {
            let mut body = payload(&run_id);
            body.status = Some(status.to_string());
            ingest(&conn, &bus, &body).expect("ingest");
        }
        let status: String = conn
            .query_row("SELECT status FROM test_runs WHERE id = ?1", params![run_id], |r| {
                r.get(0)
            })
            .expect("status");
        assert_eq!(status, "COMPLETED");
    }

    #[test]
    fn object_details_are_stored_as_json_text() {
        let conn = test_conn();
        let bus = LogBus::new();
        let run_id = queued_run(&conn);
        let mut body = payload(&run_id);
        body.details = Some(json!({"selector": "#login"}));
        let record = ingest(&conn, &bus, &body).expect("ingest");
        assert_eq!(record.details.as_deref(), Some(r##"{"selector":"#login"}"##));
    }

    #[test]
    fn unknown_run_id_is_a_store_failure() {
        let conn = test_conn();
        let bus = LogBus::new();
        let err = ingest(&conn, &bus, &payload("run_missing")).expect_err("fk violation");
        assert!(err.contains("Log insertion failed"));
    }
}
