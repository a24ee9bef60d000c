use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn open_connection(db_path: &Path) -> Result<Connection, String> {
    let connection =
        Connection::open(db_path).map_err(|e| format!("Failed to open sqlite db: {e}"))?;
    connection
        .execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|e| format!("Failed to enable foreign keys: {e}"))?;
    Ok(connection)
}

pub fn bootstrap_schema(connection: &mut Connection) -> Result<(), String> {
    connection
        .execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS test_runs (
              id TEXT PRIMARY KEY,
              user_id TEXT NOT NULL,
              url TEXT NOT NULL,
              intent TEXT NOT NULL,
              status TEXT NOT NULL DEFAULT 'QUEUED',
              mode TEXT NOT NULL DEFAULT 'sniper',
              created_at_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_test_runs_user
              ON test_runs(user_id, created_at_ms);

            CREATE TABLE IF NOT EXISTS execution_logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL,
              step_id INTEGER NOT NULL,
              role TEXT NOT NULL DEFAULT 'assistant',
              action TEXT NOT NULL DEFAULT 'log',
              status TEXT NOT NULL DEFAULT 'INFO',
              message TEXT NOT NULL,
              details TEXT,
              selector TEXT,
              value TEXT,
              screenshot_url TEXT,
              created_at_ms INTEGER NOT NULL,
              FOREIGN KEY (run_id) REFERENCES test_runs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_execution_logs_run
              ON execution_logs(run_id, step_id);

            CREATE TABLE IF NOT EXISTS user_settings (
              user_id TEXT PRIMARY KEY,
              encrypted_openai_key TEXT,
              encrypted_gemini_key TEXT,
              encrypted_groq_key TEXT,
              encrypted_anthropic_key TEXT,
              encrypted_perplexity_key TEXT,
              preferred_provider TEXT NOT NULL DEFAULT 'gemini',
              telemetry_enabled INTEGER NOT NULL DEFAULT 1,
              updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS saved_tests (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              user_id TEXT NOT NULL,
              name TEXT NOT NULL,
              intent TEXT NOT NULL,
              url TEXT NOT NULL,
              run_id TEXT NOT NULL,
              steps_json TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              FOREIGN KEY (run_id) REFERENCES test_runs(id) ON DELETE CASCADE
            );
            ",
        )
        .map_err(|e| format!("Failed to bootstrap schema: {e}"))?;
    Ok(())
}

pub fn make_id(prefix: &str) -> String {
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{}", prefix, now_ms(), seq)
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
