use crate::db::now_ms;
use crate::schema::DEFAULT_PREFERRED_PROVIDER;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rusqlite::{params, Connection};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_TOLERANCE_SECS: i64 = 5 * 60;
const SECRET_PREFIX: &str = "whsec_";
const SIGNATURE_VERSION: &str = "v1";

/// The three signature headers the identity provider sends with every
/// delivery. All must be present before any verification work happens.
#[derive(Debug, Clone)]
pub struct WebhookHeaders<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub signature: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: IdentityEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityEventData {
    pub id: Option<String>,
}

/// Outcome of a handled event, for the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    Provisioned,
    Purged,
    Ignored,
}

/// Verify a signed delivery: signed content is `{id}.{timestamp}.{body}`,
/// keyed with the base64 payload of the shared `whsec_` secret, and the
/// signature header carries one or more space-separated `v1,<base64>`
/// candidates. Comparison is constant-time via the MAC verifier. Deliveries
/// older or newer than the tolerance window are rejected outright.
pub fn verify_signature(
    secret: &str,
    headers: &WebhookHeaders<'_>,
    body: &str,
    now_secs: i64,
) -> Result<(), String> {
    let encoded_secret = secret.strip_prefix(SECRET_PREFIX).unwrap_or(secret);
    let key = BASE64
        .decode(encoded_secret)
        .map_err(|_| "Webhook secret is malformed.".to_string())?;

    let timestamp: i64 = headers
        .timestamp
        .trim()
        .parse()
        .map_err(|_| "Webhook timestamp is not numeric.".to_string())?;
    if (now_secs - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err("Webhook timestamp is outside tolerance.".to_string());
    }

    let signed_content = format!("{}.{}.{}", headers.id, timestamp, body);
    let mut mac =
        HmacSha256::new_from_slice(&key).map_err(|_| "Webhook secret is malformed.".to_string())?;
    mac.update(signed_content.as_bytes());

    for candidate in headers.signature.split_whitespace() {
        let Some((version, encoded)) = candidate.split_once(',') else {
            continue;
        };
        if version != SIGNATURE_VERSION {
            continue;
        }
        let Ok(signature) = BASE64.decode(encoded) else {
            continue;
        };
        if mac.clone().verify_slice(&signature).is_ok() {
            return Ok(());
        }
    }
    Err("Webhook signature mismatch.".to_string())
}

/// Provision or tear down the per-user settings row. `user.created` uses an
/// idempotent insert so provider redeliveries after a slow acknowledgment
/// cannot fail on the primary key; genuine store failures propagate so the
/// provider retries.
pub fn handle_identity_event(
    connection: &Connection,
    event: &IdentityEvent,
) -> Result<WebhookDisposition, String> {
    let user_id = event
        .data
        .id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| "Event missing user ID".to_string())?;

    match event.event_type.as_str() {
        "user.created" => {
            connection
                .execute(
                    "INSERT OR IGNORE INTO user_settings
                       (user_id, preferred_provider, telemetry_enabled, updated_at_ms)
                     VALUES (?1, ?2, 1, ?3)",
                    params![user_id, DEFAULT_PREFERRED_PROVIDER.as_str(), now_ms()],
                )
                .map_err(|e| format!("Failed to create user settings: {e}"))?;
            tracing::info!("user settings created for {user_id}");
            Ok(WebhookDisposition::Provisioned)
        }
        "user.deleted" => {
            connection
                .execute(
                    "DELETE FROM user_settings WHERE user_id = ?1",
                    params![user_id],
                )
                .map_err(|e| format!("Failed to delete user settings: {e}"))?;
            tracing::info!("user data purged for {user_id}");
            Ok(WebhookDisposition::Purged)
        }
        _ => Ok(WebhookDisposition::Ignored),
    }
}
