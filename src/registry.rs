use crate::db::now_ms;
use crate::dispatch::{replay_payload, WorkerTransport};
use crate::missions::{create_run, get_run, set_run_status, LaunchedMission};
use crate::schema::{ReplayStep, RunMode, RunStatus};
use crate::vault::{load_settings, resolve_credential};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// Log statuses that count as a successfully executed, replayable step.
const REPLAYABLE_STATUSES: [&str; 4] = ["SUCCESS", "PASSED", "COMPLETED", "HEALED"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedTestRecord {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub intent: String,
    pub url: String,
    pub run_id: String,
    pub steps_json: String,
    pub created_at_ms: i64,
}

impl SavedTestRecord {
    pub fn steps(&self) -> Vec<ReplayStep> {
        serde_json::from_str(&self.steps_json).unwrap_or_default()
    }
}

/// Promote a run to a named golden path. The snapshot serializes the run's
/// successful browser actions in step order; a run that never produced a
/// replayable step cannot be promoted.
pub fn promote_run(
    connection: &Connection,
    user_id: &str,
    run_id: &str,
    name: &str,
) -> Result<SavedTestRecord, String> {
    let trimmed_name = name.trim();
    if trimmed_name.is_empty() {
        return Err("A name is required to promote a run.".to_string());
    }
    let run = get_run(connection, user_id, run_id)?.ok_or_else(|| "Run not found".to_string())?;

    let steps = collect_replayable_steps(connection, run_id)?;
    if steps.is_empty() {
        return Err("Run has no replayable steps to promote.".to_string());
    }
    let steps_json =
        serde_json::to_string(&steps).map_err(|e| format!("Failed to serialize steps: {e}"))?;

    connection
        .execute(
            "INSERT INTO saved_tests (user_id, name, intent, url, run_id, steps_json, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.user_id,
                trimmed_name,
                run.intent,
                run.url,
                run.id,
                steps_json,
                now_ms()
            ],
        )
        .map_err(|e| format!("Registry save failed: {e}"))?;
    let saved_id = connection.last_insert_rowid();
    get_saved_test(connection, user_id, saved_id)?
        .ok_or_else(|| "Saved test was created but could not be reloaded.".to_string())
}

pub fn get_saved_test(
    connection: &Connection,
    user_id: &str,
    test_id: i64,
) -> Result<Option<SavedTestRecord>, String> {
    connection
        .query_row(
            "SELECT id, user_id, name, intent, url, run_id, steps_json, created_at_ms
             FROM saved_tests WHERE id = ?1 AND user_id = ?2",
            params![test_id, user_id],
            map_saved_test_row,
        )
        .optional()
        .map_err(|e| format!("Failed to load saved test: {e}"))
}

pub fn list_saved_tests(
    connection: &Connection,
    user_id: &str,
) -> Result<Vec<SavedTestRecord>, String> {
    let mut stmt = connection
        .prepare(
            "SELECT id, user_id, name, intent, url, run_id, steps_json, created_at_ms
             FROM saved_tests
             WHERE user_id = ?1
             ORDER BY created_at_ms DESC",
        )
        .map_err(|e| format!("Failed to prepare saved test list: {e}"))?;
    let rows = stmt
        .query_map(params![user_id], map_saved_test_row)
        .map_err(|e| format!("Failed to query saved tests: {e}"))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| format!("Failed to parse saved test row: {e}"))?);
    }
    Ok(out)
}

pub fn delete_saved_test(
    connection: &Connection,
    user_id: &str,
    test_id: i64,
) -> Result<bool, String> {
    let changed = connection
        .execute(
            "DELETE FROM saved_tests WHERE id = ?1 AND user_id = ?2",
            params![test_id, user_id],
        )
        .map_err(|e| format!("Failed to delete saved test: {e}"))?;
    Ok(changed > 0)
}

/// Re-dispatch a promoted blueprint: registers a fresh replay-mode run and
/// ships the recorded step sequence instead of natural-language intent.
pub fn launch_replay(
    connection: &Connection,
    transport: &dyn WorkerTransport,
    user_id: &str,
    test_id: i64,
) -> Result<LaunchedMission, String> {
    let settings = load_settings(connection, user_id)?
        .ok_or_else(|| "System Config or Blueprint missing.".to_string())?;
    let blueprint = get_saved_test(connection, user_id, test_id)?
        .ok_or_else(|| "System Config or Blueprint missing.".to_string())?;
    let credential = resolve_credential(&settings, None)?;

    let run = create_run(
        connection,
        user_id,
        &blueprint.url,
        &format!("REPLAY: {}", blueprint.name),
        RunMode::Replay,
    )?;
    let payload = replay_payload(
        user_id,
        &run.id,
        &credential,
        &blueprint.steps(),
        &blueprint.url,
    );

    if let Err(dispatch_err) = transport.dispatch(&payload) {
        set_run_status(connection, &run.id, RunStatus::Failed)?;
        return Err(dispatch_err);
    }

    Ok(LaunchedMission {
        run_id: run.id,
        message: "Regression Replay Initiated".to_string(),
    })
}

fn collect_replayable_steps(
    connection: &Connection,
    run_id: &str,
) -> Result<Vec<ReplayStep>, String> {
    let mut stmt = connection
        .prepare(
            "SELECT action, selector, value, status
             FROM execution_logs
             WHERE run_id = ?1 AND action != 'log'
             ORDER BY step_id ASC, id ASC",
        )
        .map_err(|e| format!("Failed to prepare step query: {e}"))?;
    let rows = stmt
        .query_map(params![run_id], |row| {
            let action: String = row.get(0)?;
            let selector: Option<String> = row.get(1)?;
            let value: Option<String> = row.get(2)?;
            let status: String = row.get(3)?;
            Ok((action, selector, value, status))
        })
        .map_err(|e| format!("Failed to query steps: {e}"))?;

    let mut steps = Vec::new();
    for row in rows {
        let (action, selector, value, status) =
            row.map_err(|e| format!("Failed to parse step row: {e}"))?;
        if !REPLAYABLE_STATUSES.contains(&status.to_ascii_uppercase().as_str()) {
            continue;
        }
        // Navigation rows carry their destination in the value column.
        let (value, url) = if action == "navigate" {
            (None, value)
        } else {
            (value, None)
        };
        steps.push(ReplayStep {
            action,
            selector,
            value,
            url,
        });
    }
    Ok(steps)
}

fn map_saved_test_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SavedTestRecord> {
    Ok(SavedTestRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        intent: row.get(3)?,
        url: row.get(4)?,
        run_id: row.get(5)?,
        steps_json: row.get(6)?,
        created_at_ms: row.get(7)?,
    })
}
