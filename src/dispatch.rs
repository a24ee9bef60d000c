use crate::schema::{ReplayStep, RunMode};
use crate::vault::ResolvedCredential;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;

pub const WORKER_MISSION_PATH: &str = "/mission";
const WORKER_TIMEOUT_SECS: u64 = 30;

/// Boundary to the external browser-automation worker. The live transport
/// POSTs the invocation envelope; the mock records payloads for tests.
pub trait WorkerTransport: Send + Sync {
    fn dispatch(&self, payload: &Value) -> Result<(), String>;
    fn health_check(&self) -> WorkerHealth;
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub online: bool,
    pub message: String,
}

pub struct HttpWorkerTransport {
    base_url: String,
}

impl HttpWorkerTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn mission_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            WORKER_MISSION_PATH
        )
    }
}

impl WorkerTransport for HttpWorkerTransport {
    fn dispatch(&self, payload: &Value) -> Result<(), String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(WORKER_TIMEOUT_SECS))
            .build()
            .map_err(|e| format!("Worker transport is unavailable: {e}"))?;

        let envelope = json!({ "data": [encode_envelope(payload)] });
        let response = client
            .post(self.mission_url())
            .json(&envelope)
            .send()
            .map_err(|e| {
                tracing::warn!("worker dispatch transport error: {e}");
                "AI Worker is currently offline.".to_string()
            })?;

        if !response.status().is_success() {
            return Err(format!("Worker returned {}", response.status().as_u16()));
        }
        Ok(())
    }

    fn health_check(&self) -> WorkerHealth {
        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(WORKER_TIMEOUT_SECS))
            .build()
        {
            Ok(client) => client,
            Err(_) => {
                return WorkerHealth {
                    online: false,
                    message: "Connection Refused".to_string(),
                }
            }
        };
        match client
            .get(&self.base_url)
            .header("Cache-Control", "no-cache")
            .send()
        {
            Ok(response) if response.status().as_u16() == 503 => WorkerHealth {
                online: false,
                message: "Worker is asleep. Wake it up and retry.".to_string(),
            },
            // A bare worker root may reject GET with 405 while still being up.
            Ok(response) => WorkerHealth {
                online: response.status().is_success() || response.status().as_u16() == 405,
                message: "AI Worker is Online.".to_string(),
            },
            Err(_) => WorkerHealth {
                online: false,
                message: "Connection Refused".to_string(),
            },
        }
    }
}

/// Test transport: records every dispatched payload, optionally failing.
#[derive(Default)]
pub struct MockWorkerTransport {
    pub fail: bool,
    dispatched: Mutex<Vec<Value>>,
}

impl MockWorkerTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            dispatched: Mutex::new(Vec::new()),
        }
    }

    pub fn dispatched(&self) -> Vec<Value> {
        self.dispatched.lock().expect("mock transport lock").clone()
    }
}

impl WorkerTransport for MockWorkerTransport {
    fn dispatch(&self, payload: &Value) -> Result<(), String> {
        if self.fail {
            return Err("AI Worker is currently offline.".to_string());
        }
        self.dispatched
            .lock()
            .expect("mock transport lock")
            .push(payload.clone());
        Ok(())
    }

    fn health_check(&self) -> WorkerHealth {
        WorkerHealth {
            online: !self.fail,
            message: if self.fail {
                "Connection Refused".to_string()
            } else {
                "AI Worker is Online.".to_string()
            },
        }
    }
}

/// The worker invocation protocol wraps one base64-encoded JSON payload in a
/// single-element `data` array.
pub fn encode_envelope(payload: &Value) -> String {
    BASE64.encode(payload.to_string())
}

pub fn decode_envelope(encoded: &str) -> Result<Value, String> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| "Envelope is not valid base64.".to_string())?;
    serde_json::from_slice(&bytes).map_err(|_| "Envelope payload is not valid JSON.".to_string())
}

/// Payload for sniper and chaos runs. The credential ships as ciphertext;
/// only the worker holds the master key for this boundary.
pub fn mission_payload(
    user_id: &str,
    run_id: &str,
    credential: &ResolvedCredential,
    mode: RunMode,
    instructions: &str,
    base_url: &str,
    test_data: &Value,
) -> Value {
    json!({
        "user_id": user_id,
        "run_id": run_id,
        "api_key": credential.encrypted_key,
        "provider": credential.provider.as_str(),
        "model": credential.provider.default_model(),
        "mode": mode.as_str(),
        "instructions": instructions,
        "context": { "baseUrl": base_url, "testData": test_data },
    })
}

pub fn scout_payload(
    user_id: &str,
    run_id: &str,
    credential: &ResolvedCredential,
    url: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Value {
    json!({
        "user_id": user_id,
        "run_id": run_id,
        "api_key": credential.encrypted_key,
        "provider": credential.provider.as_str(),
        "model": credential.provider.default_model(),
        "mode": RunMode::Scout.as_str(),
        "url": url,
        "credentials": { "username": username, "password": password },
    })
}

pub fn replay_payload(
    user_id: &str,
    run_id: &str,
    credential: &ResolvedCredential,
    steps: &[ReplayStep],
    base_url: &str,
) -> Value {
    json!({
        "user_id": user_id,
        "run_id": run_id,
        "api_key": credential.encrypted_key,
        "provider": credential.provider.as_str(),
        "model": credential.provider.default_model(),
        "mode": RunMode::Replay.as_str(),
        "steps": steps,
        "context": { "baseUrl": base_url },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ProviderKind;
    use pretty_assertions::assert_eq;

    fn credential() -> ResolvedCredential {
        ResolvedCredential {
            provider: ProviderKind::Groq,
            encrypted_key: "00ff:aabb".to_string(),
        }
    }

    #[test]
    fn envelope_round_trips_payload_json() {
        let payload = mission_payload(
            "user_1",
            "run_1",
            &credential(),
            RunMode::Sniper,
            "1. Navigate to /login",
            "https://shop.test",
            &json!({"user": "demo"}),
        );
        let decoded = decode_envelope(&encode_envelope(&payload)).expect("decode");
        assert_eq!(decoded, payload);
        assert_eq!(decoded["mode"], "sniper");
        assert_eq!(decoded["api_key"], "00ff:aabb");
        assert_eq!(decoded["context"]["testData"]["user"], "demo");
    }

    #[test]
    fn decode_envelope_rejects_garbage() {
        assert!(decode_envelope("not-base64!").is_err());
        assert!(decode_envelope(&BASE64.encode("not json")).is_err());
    }

    #[test]
    fn scout_payload_carries_basic_auth_credentials() {
        let payload = scout_payload(
            "user_1",
            "run_2",
            &credential(),
            "https://shop.test",
            Some("admin"),
            None,
        );
        assert_eq!(payload["mode"], "scout");
        assert_eq!(payload["credentials"]["username"], "admin");
        assert!(payload["credentials"]["password"].is_null());
        assert!(payload.get("instructions").is_none());
    }

    #[test]
    fn replay_payload_ships_recorded_steps() {
        let steps = vec![ReplayStep {
            action: "click".to_string(),
            selector: Some("#login".to_string()),
            value: None,
            url: None,
        }];
        let payload = replay_payload("user_1", "run_3", &credential(), &steps, "https://shop.test");
        assert_eq!(payload["mode"], "replay");
        assert_eq!(payload["steps"][0]["action"], "click");
    }

    #[test]
    fn mock_transport_records_payloads_and_can_fail() {
        let transport = MockWorkerTransport::new();
        transport.dispatch(&json!({"run_id": "run_1"})).expect("ok");
        assert_eq!(transport.dispatched().len(), 1);

        let failing = MockWorkerTransport::failing();
        assert!(failing.dispatch(&json!({})).is_err());
        assert!(!failing.health_check().online);
    }

    #[test]
    fn mission_url_normalizes_trailing_slash() {
        let transport = HttpWorkerTransport::new("https://worker.test/");
        assert_eq!(transport.mission_url(), "https://worker.test/mission");
    }
}
