use crate::schema::ProviderKind;
use crate::vault::{load_settings, VaultCipher};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

const PROBE_TIMEOUT_SECS: u64 = 8;

/// Outcome of a key probe, shaped for the settings surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    pub message: String,
}

/// Internal probe failures. Raw transport errors stay server-side; the
/// user only ever sees the fixed message table below.
#[derive(Debug, Error)]
enum ProbeError {
    #[error("VAULT_NOT_FOUND")]
    VaultNotFound,
    #[error("KEY_NOT_STORED")]
    KeyNotStored,
    #[error("DECRYPTION_FAILED")]
    DecryptionFailed,
    #[error("TIMED_OUT")]
    TimedOut,
    #[error("NETWORK: {0}")]
    Network(String),
}

impl ProbeError {
    fn user_message(&self) -> &'static str {
        match self {
            Self::VaultNotFound => "No settings found. Save your keys first.",
            Self::KeyNotStored => "Key not found in vault. Store it first.",
            Self::DecryptionFailed => "Vault master key mismatch. Re-save your keys.",
            Self::TimedOut => "Connection timed out. API may be down.",
            Self::Network(_) => "System Network Error",
        }
    }
}

enum ProbeMethod {
    Get,
    Post,
}

/// How to talk to one provider: method, endpoint, auth placement, and an
/// optional minimal body. Providers disagree on auth (bearer header,
/// custom header, query-string key), so each carries its own builder.
struct ProbeStrategy {
    url: &'static str,
    method: ProbeMethod,
    key_in_query: bool,
    headers: fn(&str) -> Vec<(&'static str, String)>,
    body: Option<Value>,
}

fn probe_strategy(provider: ProviderKind) -> ProbeStrategy {
    match provider {
        ProviderKind::OpenAi => ProbeStrategy {
            url: "https://api.openai.com/v1/models",
            method: ProbeMethod::Get,
            key_in_query: false,
            headers: |key| vec![("Authorization", format!("Bearer {key}"))],
            body: None,
        },
        ProviderKind::Groq => ProbeStrategy {
            url: "https://api.groq.com/openai/v1/models",
            method: ProbeMethod::Get,
            key_in_query: false,
            headers: |key| vec![("Authorization", format!("Bearer {key}"))],
            body: None,
        },
        ProviderKind::Anthropic => ProbeStrategy {
            url: "https://api.anthropic.com/v1/messages",
            method: ProbeMethod::Post,
            key_in_query: false,
            headers: |key| {
                vec![
                    ("x-api-key", key.to_string()),
                    ("anthropic-version", "2023-06-01".to_string()),
                ]
            },
            body: Some(json!({
                "model": "claude-3-haiku-20240307",
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "Hi"}],
            })),
        },
        ProviderKind::Sonar => ProbeStrategy {
            url: "https://api.perplexity.ai/chat/completions",
            method: ProbeMethod::Post,
            key_in_query: false,
            headers: |key| vec![("Authorization", format!("Bearer {key}"))],
            body: Some(json!({
                "model": "sonar",
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "ping"}],
            })),
        },
        ProviderKind::Gemini => ProbeStrategy {
            url: "https://generativelanguage.googleapis.com/v1beta/models",
            method: ProbeMethod::Get,
            key_in_query: true,
            headers: |_| Vec::new(),
            body: None,
        },
    }
}

/// Fire a minimal, low-cost request against the provider to confirm the key
/// works. Uses the supplied plaintext when given, otherwise resolves and
/// decrypts the stored key. No side effects beyond the outbound probe.
pub fn test_provider_key(
    connection: &Connection,
    cipher: &VaultCipher,
    user_id: &str,
    provider: ProviderKind,
    manual_key: Option<&str>,
) -> ProbeResult {
    match run_probe(connection, cipher, user_id, provider, manual_key) {
        Ok(result) => result,
        Err(probe_err) => {
            tracing::warn!("key probe for {} failed: {probe_err}", provider.as_str());
            ProbeResult {
                success: false,
                message: probe_err.user_message().to_string(),
            }
        }
    }
}

fn run_probe(
    connection: &Connection,
    cipher: &VaultCipher,
    user_id: &str,
    provider: ProviderKind,
    manual_key: Option<&str>,
) -> Result<ProbeResult, ProbeError> {
    let api_key = match manual_key.map(str::trim).filter(|v| !v.is_empty()) {
        Some(key) => key.to_string(),
        None => {
            let settings = load_settings(connection, user_id)
                .map_err(ProbeError::Network)?
                .ok_or(ProbeError::VaultNotFound)?;
            let encrypted = settings
                .encrypted_key_for(provider)
                .ok_or(ProbeError::KeyNotStored)?;
            cipher
                .decrypt(encrypted)
                .ok_or(ProbeError::DecryptionFailed)?
        }
    };

    let strategy = probe_strategy(provider);
    let url = if strategy.key_in_query {
        format!("{}?key={}", strategy.url, api_key)
    } else {
        strategy.url.to_string()
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let mut request = match strategy.method {
        ProbeMethod::Get => client.get(&url),
        ProbeMethod::Post => client.post(&url),
    };
    for (name, value) in (strategy.headers)(&api_key) {
        request = request.header(name, value);
    }
    if let Some(body) = &strategy.body {
        request = request.json(body);
    }

    let response = request.send().map_err(|e| {
        if e.is_timeout() {
            ProbeError::TimedOut
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Ok(ProbeResult {
            success: false,
            message: "Invalid API Key".to_string(),
        });
    }
    if !status.is_success() {
        return Ok(ProbeResult {
            success: false,
            message: format!("Invalid Key ({})", status.as_u16()),
        });
    }
    Ok(ProbeResult {
        success: true,
        message: "Connection Successful".to_string(),
    })
}
