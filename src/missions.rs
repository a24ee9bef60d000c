use crate::db::{make_id, now_ms};
use crate::dispatch::{mission_payload, scout_payload, WorkerTransport};
use crate::schema::{ProviderKind, RunMode, RunStatus};
use crate::telemetry::{fetch_logs, ExecutionLogRecord};
use crate::vault::{load_settings, resolve_credential};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

pub const CONTEXT_OPEN: &str = "[MISSION CONTEXT]";
pub const CONTEXT_CLOSE: &str = "[/MISSION CONTEXT]";
const MIN_INTENT_CHARS: usize = 8;
const SCOUT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub user_id: String,
    pub url: String,
    pub intent: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    pub run: RunRecord,
    pub logs: Vec<ExecutionLogRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlRecord {
    pub id: String,
    pub url: String,
    pub timestamp: String,
    pub report_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchMissionInput {
    pub url: String,
    pub intent: String,
    pub provider: Option<String>,
    pub test_data: Option<String>,
    #[serde(default)]
    pub is_chaos: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchScoutInput {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchedMission {
    pub run_id: String,
    pub message: String,
}

/// Machine context recovered from a composite intent string.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentContext {
    pub target_url: Option<String>,
    pub test_data: Value,
    pub instruction: String,
}

pub fn create_run(
    connection: &Connection,
    user_id: &str,
    url: &str,
    intent: &str,
    mode: RunMode,
) -> Result<RunRecord, String> {
    let run_id = make_id("run");
    let now = now_ms();
    connection
        .execute(
            "INSERT INTO test_runs (id, user_id, url, intent, status, mode, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                user_id,
                url,
                intent,
                RunStatus::Queued.as_str(),
                mode.as_str(),
                now
            ],
        )
        .map_err(|e| format!("Cloud DB registration failed: {e}"))?;
    Ok(RunRecord {
        id: run_id,
        user_id: user_id.to_string(),
        url: url.to_string(),
        intent: intent.to_string(),
        status: RunStatus::Queued,
        mode,
        created_at_ms: now,
    })
}

/// Status writes are unconditional by run id: the telemetry path acts on
/// behalf of the worker and the dispatcher flips its own just-created run.
pub fn set_run_status(
    connection: &Connection,
    run_id: &str,
    status: RunStatus,
) -> Result<(), String> {
    connection
        .execute(
            "UPDATE test_runs SET status = ?1 WHERE id = ?2",
            params![status.as_str(), run_id],
        )
        .map_err(|e| format!("Failed to update run status: {e}"))?;
    Ok(())
}

pub fn get_run(
    connection: &Connection,
    user_id: &str,
    run_id: &str,
) -> Result<Option<RunRecord>, String> {
    connection
        .query_row(
            "SELECT id, user_id, url, intent, status, mode, created_at_ms
             FROM test_runs WHERE id = ?1 AND user_id = ?2",
            params![run_id, user_id],
            map_run_row,
        )
        .optional()
        .map_err(|e| format!("Failed to load run: {e}"))
}

pub fn get_run_detail(
    connection: &Connection,
    user_id: &str,
    run_id: &str,
) -> Result<Option<RunDetail>, String> {
    let Some(run) = get_run(connection, user_id, run_id)? else {
        return Ok(None);
    };
    let logs = fetch_logs(connection, run_id)?;
    Ok(Some(RunDetail { run, logs }))
}

pub fn list_runs(
    connection: &Connection,
    user_id: &str,
    limit: usize,
) -> Result<Vec<RunRecord>, String> {
    let mut stmt = connection
        .prepare(
            "SELECT id, user_id, url, intent, status, mode, created_at_ms
             FROM test_runs
             WHERE user_id = ?1
             ORDER BY created_at_ms DESC
             LIMIT ?2",
        )
        .map_err(|e| format!("Failed to prepare runs list: {e}"))?;
    let rows = stmt
        .query_map(params![user_id, limit as i64], map_run_row)
        .map_err(|e| format!("Failed to query runs: {e}"))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| format!("Failed to parse run row: {e}"))?);
    }
    Ok(out)
}

/// Owner-scoped delete; log rows go with the run via the cascade.
pub fn delete_run(connection: &Connection, user_id: &str, run_id: &str) -> Result<bool, String> {
    let changed = connection
        .execute(
            "DELETE FROM test_runs WHERE id = ?1 AND user_id = ?2",
            params![run_id, user_id],
        )
        .map_err(|e| format!("Failed to delete run: {e}"))?;
    Ok(changed > 0)
}

pub fn list_scout_history(
    connection: &Connection,
    user_id: &str,
) -> Result<Vec<CrawlRecord>, String> {
    let mut stmt = connection
        .prepare(
            "SELECT id, url, created_at_ms
             FROM test_runs
             WHERE user_id = ?1 AND mode = 'scout'
             ORDER BY created_at_ms DESC
             LIMIT ?2",
        )
        .map_err(|e| format!("Failed to prepare scout history: {e}"))?;
    let rows = stmt
        .query_map(params![user_id, SCOUT_HISTORY_LIMIT as i64], |row| {
            let id: String = row.get(0)?;
            let created_at_ms: i64 = row.get(2)?;
            Ok(CrawlRecord {
                report_path: format!("QA_REPORT_{id}.md"),
                id,
                url: row.get(1)?,
                timestamp: chrono::DateTime::from_timestamp_millis(created_at_ms)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default(),
            })
        })
        .map_err(|e| format!("Failed to query scout history: {e}"))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| format!("Failed to parse scout history row: {e}"))?);
    }
    Ok(out)
}

/// Launch a sniper or chaos mission: validate, resolve the credential
/// before any insert, register the run, then hand off to the worker. A
/// dispatch failure flips the freshly created run to FAILED so the caller
/// learns the job never started.
pub fn launch_mission(
    connection: &Connection,
    transport: &dyn WorkerTransport,
    user_id: &str,
    input: &LaunchMissionInput,
) -> Result<LaunchedMission, String> {
    let target_url = validate_target_url(&input.url)?;
    let intent = input.intent.trim();
    if intent.chars().count() < MIN_INTENT_CHARS {
        return Err("Mission intent is too short.".to_string());
    }
    let test_data = parse_test_data(input.test_data.as_deref());
    let requested = match input.provider.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Some(ProviderKind::parse(value)?),
        _ => None,
    };

    let settings =
        load_settings(connection, user_id)?.ok_or_else(|| "ABORTED: No API keys found.".to_string())?;
    let credential = resolve_credential(&settings, requested)?;

    let has_test_data = test_data
        .as_object()
        .map(|map| !map.is_empty())
        .unwrap_or(false);
    let stored_intent = if has_test_data {
        compose_intent(&target_url, &test_data, intent)
    } else {
        intent.to_string()
    };
    let mode = if input.is_chaos {
        RunMode::Chaos
    } else {
        RunMode::Sniper
    };

    let run = create_run(connection, user_id, &target_url, &stored_intent, mode)?;
    let payload = mission_payload(
        user_id,
        &run.id,
        &credential,
        mode,
        &stored_intent,
        &target_url,
        &test_data,
    );

    if let Err(dispatch_err) = transport.dispatch(&payload) {
        set_run_status(connection, &run.id, RunStatus::Failed)?;
        return Err(dispatch_err);
    }

    Ok(LaunchedMission {
        run_id: run.id,
        message: "Mission Launched".to_string(),
    })
}

/// Autonomous discovery: no instruction script, optional basic-auth
/// credentials for gated targets. Provider selection falls back through the
/// stored preference.
pub fn launch_scout(
    connection: &Connection,
    transport: &dyn WorkerTransport,
    user_id: &str,
    input: &LaunchScoutInput,
) -> Result<LaunchedMission, String> {
    let target_url = validate_target_url(&input.url)?;
    let settings = load_settings(connection, user_id)?
        .ok_or_else(|| "ABORTED: API keys missing.".to_string())?;
    let credential = resolve_credential(&settings, None)?;

    let run = create_run(
        connection,
        user_id,
        &target_url,
        "AUTONOMOUS SCOUT: Discovering site structure.",
        RunMode::Scout,
    )?;
    let payload = scout_payload(
        user_id,
        &run.id,
        &credential,
        &target_url,
        input.username.as_deref().filter(|v| !v.trim().is_empty()),
        input.password.as_deref().filter(|v| !v.trim().is_empty()),
    );

    if let Err(dispatch_err) = transport.dispatch(&payload) {
        set_run_status(connection, &run.id, RunStatus::Failed)?;
        return Err(dispatch_err);
    }

    Ok(LaunchedMission {
        run_id: run.id,
        message: "Scout drone launched.".to_string(),
    })
}

/// Embed machine context into the stored intent so the worker can recover
/// target URL and injected test data from the single intent field.
pub fn compose_intent(target_url: &str, test_data: &Value, instruction: &str) -> String {
    format!(
        "{CONTEXT_OPEN}\ntarget_url: {target_url}\ntest_data: {test_data}\n{CONTEXT_CLOSE}\n{instruction}"
    )
}

pub fn parse_intent(intent: &str) -> IntentContext {
    let Some(open) = intent.find(CONTEXT_OPEN) else {
        return IntentContext {
            target_url: None,
            test_data: json!({}),
            instruction: intent.trim().to_string(),
        };
    };
    let after_open = &intent[open + CONTEXT_OPEN.len()..];
    let Some(close) = after_open.find(CONTEXT_CLOSE) else {
        return IntentContext {
            target_url: None,
            test_data: json!({}),
            instruction: intent.trim().to_string(),
        };
    };

    let block = &after_open[..close];
    let mut target_url = None;
    let mut test_data = json!({});
    for line in block.lines() {
        if let Some(value) = line.strip_prefix("target_url: ") {
            target_url = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("test_data: ") {
            test_data = serde_json::from_str(value.trim()).unwrap_or_else(|_| json!({}));
        }
    }
    let instruction = after_open[close + CONTEXT_CLOSE.len()..].trim().to_string();
    IntentContext {
        target_url,
        test_data,
        instruction,
    }
}

fn validate_target_url(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let parsed =
        Url::parse(trimmed).map_err(|_| "A valid http(s) target URL is required.".to_string())?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err("A valid http(s) target URL is required.".to_string());
    }
    Ok(trimmed.to_string())
}

/// Malformed optional test data degrades to an empty object instead of
/// failing the launch.
fn parse_test_data(raw: Option<&str>) -> Value {
    raw.and_then(|text| {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(trimmed)
            .ok()
            .filter(Value::is_object)
    })
    .unwrap_or_else(|| json!({}))
}

fn map_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(4)?;
    let mode: String = row.get(5)?;
    Ok(RunRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        url: row.get(2)?,
        intent: row.get(3)?,
        status: RunStatus::parse(&status).map_err(|_| {
            rusqlite::Error::InvalidColumnType(4, "status".to_string(), rusqlite::types::Type::Text)
        })?,
        mode: RunMode::parse(&mode).map_err(|_| {
            rusqlite::Error::InvalidColumnType(5, "mode".to_string(), rusqlite::types::Type::Text)
        })?,
        created_at_ms: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap_schema;
    use crate::dispatch::MockWorkerTransport;
    use crate::vault::{save_vault, SaveVaultInput, VaultCipher};
    use pretty_assertions::assert_eq;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open");
        bootstrap_schema(&mut conn).expect("bootstrap");
        conn
    }

    fn test_cipher() -> VaultCipher {
        VaultCipher::from_master_secret("unit-test-master-secret").expect("cipher")
    }

    fn store_key(conn: &Connection, cipher: &VaultCipher, user_id: &str, provider: &str) {
        let mut input = SaveVaultInput::default();
        match provider {
            "openai" => input.openai_key = Some("sk-openai".to_string()),
            "groq" => input.groq_key = Some("gsk-groq".to_string()),
            "gemini" => input.gemini_key = Some("AIza-gemini".to_string()),
            other => panic!("unexpected provider {other}"),
        }
        save_vault(conn, cipher, user_id, &input).expect("save vault");
    }

    fn sniper_input() -> LaunchMissionInput {
        LaunchMissionInput {
            url: "https://shop.test".to_string(),
            intent: "1. Navigate to /login 2. Input {{user}}".to_string(),
            provider: Some("groq".to_string()),
            test_data: None,
            is_chaos: false,
        }
    }

    #[test]
    fn launch_without_stored_key_creates_no_run_row() {
        let conn = test_conn();
        let cipher = test_cipher();
        store_key(&conn, &cipher, "user_1", "openai");
        let transport = MockWorkerTransport::new();

        let err = launch_mission(&conn, &transport, "user_1", &sniper_input())
            .expect_err("no groq key");
        assert_eq!(err, "Access Denied: No encrypted key found for GROQ.");

        let run_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM test_runs", [], |r| r.get(0))
            .expect("count");
        assert_eq!(run_count, 0);
        assert!(transport.dispatched().is_empty());
    }

    #[test]
    fn launch_with_stored_key_queues_run_and_ships_ciphertext() {
        let conn = test_conn();
        let cipher = test_cipher();
        store_key(&conn, &cipher, "user_1", "groq");
        let transport = MockWorkerTransport::new();

        let launched = launch_mission(&conn, &transport, "user_1", &sniper_input())
            .expect("launched");
        assert_eq!(launched.message, "Mission Launched");

        let run = get_run(&conn, "user_1", &launched.run_id)
            .expect("load")
            .expect("run");
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.mode, RunMode::Sniper);

        let payloads = transport.dispatched();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0]["mode"], "sniper");
        assert_eq!(payloads[0]["provider"], "groq");
        let shipped_key = payloads[0]["api_key"].as_str().expect("api_key");
        assert_ne!(shipped_key, "gsk-groq");
        assert_eq!(cipher.decrypt(shipped_key).as_deref(), Some("gsk-groq"));
    }

    #[test]
    fn dispatch_failure_marks_run_failed_and_surfaces_error() {
        let conn = test_conn();
        let cipher = test_cipher();
        store_key(&conn, &cipher, "user_1", "groq");
        let transport = MockWorkerTransport::failing();

        let err = launch_mission(&conn, &transport, "user_1", &sniper_input())
            .expect_err("worker offline");
        assert_eq!(err, "AI Worker is currently offline.");

        let status: String = conn
            .query_row("SELECT status FROM test_runs", [], |r| r.get(0))
            .expect("status");
        assert_eq!(status, "FAILED");
    }

    #[test]
    fn chaos_flag_switches_mode_on_row_and_payload() {
        let conn = test_conn();
        let cipher = test_cipher();
        store_key(&conn, &cipher, "user_1", "groq");
        let transport = MockWorkerTransport::new();

        let mut input = sniper_input();
        input.is_chaos = true;
        let launched =
            launch_mission(&conn, &transport, "user_1", &input).expect("launched");
        let run = get_run(&conn, "user_1", &launched.run_id)
            .expect("load")
            .expect("run");
        assert_eq!(run.mode, RunMode::Chaos);
        assert_eq!(transport.dispatched()[0]["mode"], "chaos");
    }

    #[test]
    fn test_data_is_embedded_as_composite_intent() {
        let conn = test_conn();
        let cipher = test_cipher();
        store_key(&conn, &cipher, "user_1", "groq");
        let transport = MockWorkerTransport::new();

        let mut input = sniper_input();
        input.test_data = Some(r#"{"user": "demo@shop.test"}"#.to_string());
        let launched =
            launch_mission(&conn, &transport, "user_1", &input).expect("launched");

        let run = get_run(&conn, "user_1", &launched.run_id)
            .expect("load")
            .expect("run");
        let context = parse_intent(&run.intent);
        assert_eq!(context.target_url.as_deref(), Some("https://shop.test"));
        assert_eq!(context.test_data["user"], "demo@shop.test");
        assert_eq!(context.instruction, "1. Navigate to /login 2. Input {{user}}");
    }

    #[test]
    fn malformed_test_data_degrades_to_empty_object() {
        assert_eq!(parse_test_data(Some("{not json")), json!({}));
        assert_eq!(parse_test_data(Some("[1, 2]")), json!({}));
        assert_eq!(parse_test_data(None), json!({}));
    }

    #[test]
    fn plain_intent_parses_back_without_context() {
        let context = parse_intent("Just check the checkout page");
        assert_eq!(context.target_url, None);
        assert_eq!(context.test_data, json!({}));
        assert_eq!(context.instruction, "Just check the checkout page");
    }

    #[test]
    fn validation_rejects_bad_url_and_short_intent() {
        let conn = test_conn();
        let transport = MockWorkerTransport::new();

        let mut input = sniper_input();
        input.url = "ftp://shop.test".to_string();
        assert!(launch_mission(&conn, &transport, "user_1", &input).is_err());

        let mut input = sniper_input();
        input.intent = "hi".to_string();
        assert_eq!(
            launch_mission(&conn, &transport, "user_1", &input).expect_err("short"),
            "Mission intent is too short."
        );
    }

    #[test]
    fn scout_launch_uses_fallback_credential_order() {
        let conn = test_conn();
        let cipher = test_cipher();
        store_key(&conn, &cipher, "user_1", "openai");
        let transport = MockWorkerTransport::new();

        let launched = launch_scout(
            &conn,
            &transport,
            "user_1",
            &LaunchScoutInput {
                url: "https://shop.test".to_string(),
                username: Some("admin".to_string()),
                password: None,
            },
        )
        .expect("scout launched");
        assert_eq!(launched.message, "Scout drone launched.");

        let run = get_run(&conn, "user_1", &launched.run_id)
            .expect("load")
            .expect("run");
        assert_eq!(run.mode, RunMode::Scout);

        let payload = &transport.dispatched()[0];
        assert_eq!(payload["provider"], "openai");
        assert_eq!(payload["credentials"]["username"], "admin");
    }

    #[test]
    fn runs_are_invisible_across_users() {
        let conn = test_conn();
        let run = create_run(
            &conn,
            "user_1",
            "https://shop.test",
            "check the login flow",
            RunMode::Sniper,
        )
        .expect("create");

        assert!(get_run(&conn, "user_2", &run.id).expect("load").is_none());
        assert!(!delete_run(&conn, "user_2", &run.id).expect("delete"));
        assert!(delete_run(&conn, "user_1", &run.id).expect("delete"));
    }

    #[test]
    fn scout_history_lists_only_scout_runs() {
        let conn = test_conn();
        create_run(&conn, "user_1", "https://a.test", "scouting", RunMode::Scout).expect("scout");
        create_run(&conn, "user_1", "https://b.test", "sniper run", RunMode::Sniper)
            .expect("sniper");

        let history = list_scout_history(&conn, "user_1").expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].url, "https://a.test");
        assert!(history[0].report_path.starts_with("QA_REPORT_run_"));
        assert!(!history[0].timestamp.is_empty());
    }
}
