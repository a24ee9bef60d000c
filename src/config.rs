use std::path::PathBuf;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_DB_PATH: &str = "argus.sqlite";

/// Process configuration resolved once at startup. Required values missing
/// from the environment abort startup; per-request code never re-reads env.
#[derive(Debug, Clone)]
pub struct Settings {
    pub worker_url: String,
    pub vault_master_key: String,
    pub webhook_secret: Option<String>,
    pub db_path: PathBuf,
    pub bind_addr: String,
}

impl Settings {
    pub fn from_env() -> Result<Self, String> {
        let worker_url = required("ARGUS_WORKER_URL")?;
        let vault_master_key = required("ARGUS_VAULT_MASTER_KEY")?;
        let webhook_secret = optional("ARGUS_WEBHOOK_SECRET");
        let db_path = optional("ARGUS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));
        let bind_addr = optional("ARGUS_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        Ok(Self {
            worker_url,
            vault_master_key,
            webhook_secret,
            db_path,
            bind_addr,
        })
    }
}

fn required(name: &str) -> Result<String, String> {
    optional(name).ok_or_else(|| format!("CRITICAL: {name} is missing from environment."))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
