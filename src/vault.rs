use crate::db::now_ms;
use crate::schema::{ProviderKind, DEFAULT_PREFERRED_PROVIDER};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LENGTH: usize = 16;

/// Symmetric cipher for provider credentials at rest. Built once at startup
/// from the master secret; ciphertext format is `iv_hex:ciphertext_hex`
/// (AES-256-CBC, PKCS#7, key = SHA-256 of the master secret) so the worker
/// holding the same secret can decrypt on its side of the boundary.
#[derive(Clone)]
pub struct VaultCipher {
    master_key: [u8; 32],
}

impl VaultCipher {
    pub fn from_master_secret(secret: &str) -> Result<Self, String> {
        let normalized = secret.trim().trim_matches(|c| c == '"' || c == '\'');
        if normalized.is_empty() {
            return Err("CRITICAL: vault master key is missing.".to_string());
        }
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Ok(Self {
            master_key: hasher.finalize().into(),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LENGTH];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(&self.master_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
    }

    /// Returns `None` on any malformed or undecryptable input. Failures are
    /// logged without the ciphertext or key material.
    pub fn decrypt(&self, encrypted: &str) -> Option<String> {
        let Some((iv_hex, data_hex)) = encrypted.split_once(':') else {
            tracing::warn!("vault decrypt rejected input without separator");
            return None;
        };
        let iv = match hex::decode(iv_hex) {
            Ok(bytes) if bytes.len() == IV_LENGTH => bytes,
            _ => {
                tracing::warn!("vault decrypt rejected malformed iv");
                return None;
            }
        };
        let data = match hex::decode(data_hex) {
            Ok(bytes) => bytes,
            Err(_) => {
                tracing::warn!("vault decrypt rejected malformed ciphertext hex");
                return None;
            }
        };
        let iv: [u8; IV_LENGTH] = iv.try_into().ok()?;
        let plaintext = Aes256CbcDec::new(&self.master_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&data)
            .ok()?;
        match String::from_utf8(plaintext) {
            Ok(text) => Some(text),
            Err(_) => {
                tracing::warn!("vault decrypt produced non-utf8 plaintext");
                None
            }
        }
    }
}

/// One `user_settings` row. Encrypted slots hold ciphertext only; plaintext
/// never reaches the store.
#[derive(Debug, Clone)]
pub struct SettingsRow {
    pub user_id: String,
    pub encrypted_openai_key: Option<String>,
    pub encrypted_gemini_key: Option<String>,
    pub encrypted_groq_key: Option<String>,
    pub encrypted_anthropic_key: Option<String>,
    pub encrypted_perplexity_key: Option<String>,
    pub preferred_provider: String,
    pub telemetry_enabled: bool,
    pub updated_at_ms: i64,
}

impl SettingsRow {
    pub fn encrypted_key_for(&self, provider: ProviderKind) -> Option<&str> {
        let slot = match provider {
            ProviderKind::OpenAi => &self.encrypted_openai_key,
            ProviderKind::Gemini => &self.encrypted_gemini_key,
            ProviderKind::Groq => &self.encrypted_groq_key,
            ProviderKind::Anthropic => &self.encrypted_anthropic_key,
            ProviderKind::Sonar => &self.encrypted_perplexity_key,
        };
        slot.as_deref().filter(|v| !v.is_empty())
    }

    pub fn first_stored_provider(&self) -> Option<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .find(|provider| self.encrypted_key_for(*provider).is_some())
    }
}

/// Presence-only projection of a user's vault; never carries ciphertext.
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub keys: VaultKeyPresence,
    pub preferred: String,
    pub telemetry_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultKeyPresence {
    pub openai: bool,
    pub gemini: bool,
    pub groq: bool,
    pub anthropic: bool,
    pub sonar: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaveVaultInput {
    pub openai_key: Option<String>,
    pub gemini_key: Option<String>,
    pub groq_key: Option<String>,
    pub anthropic_key: Option<String>,
    pub perplexity_key: Option<String>,
    pub preferred_provider: Option<String>,
    pub telemetry_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub provider: ProviderKind,
    pub encrypted_key: String,
}

pub fn load_settings(
    connection: &Connection,
    user_id: &str,
) -> Result<Option<SettingsRow>, String> {
    connection
        .query_row(
            "SELECT user_id, encrypted_openai_key, encrypted_gemini_key, encrypted_groq_key,
                    encrypted_anthropic_key, encrypted_perplexity_key, preferred_provider,
                    telemetry_enabled, updated_at_ms
             FROM user_settings WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(SettingsRow {
                    user_id: row.get(0)?,
                    encrypted_openai_key: row.get(1)?,
                    encrypted_gemini_key: row.get(2)?,
                    encrypted_groq_key: row.get(3)?,
                    encrypted_anthropic_key: row.get(4)?,
                    encrypted_perplexity_key: row.get(5)?,
                    preferred_provider: row.get(6)?,
                    telemetry_enabled: row.get(7)?,
                    updated_at_ms: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to load user settings: {e}"))
}

pub fn vault_status(connection: &Connection, user_id: &str) -> Result<VaultStatus, String> {
    let settings = load_settings(connection, user_id)?;
    let Some(settings) = settings else {
        return Ok(VaultStatus {
            keys: VaultKeyPresence {
                openai: false,
                gemini: false,
                groq: false,
                anthropic: false,
                sonar: false,
            },
            preferred: DEFAULT_PREFERRED_PROVIDER.as_str().to_string(),
            telemetry_enabled: true,
        });
    };
    Ok(VaultStatus {
        keys: VaultKeyPresence {
            openai: settings.encrypted_key_for(ProviderKind::OpenAi).is_some(),
            gemini: settings.encrypted_key_for(ProviderKind::Gemini).is_some(),
            groq: settings.encrypted_key_for(ProviderKind::Groq).is_some(),
            anthropic: settings
                .encrypted_key_for(ProviderKind::Anthropic)
                .is_some(),
            sonar: settings.encrypted_key_for(ProviderKind::Sonar).is_some(),
        },
        preferred: settings.preferred_provider.clone(),
        telemetry_enabled: settings.telemetry_enabled,
    })
}

/// Partial-update save: a blank or omitted field keeps the ciphertext
/// already on the row, so submitting one key never erases the others.
pub fn save_vault(
    connection: &Connection,
    cipher: &VaultCipher,
    user_id: &str,
    input: &SaveVaultInput,
) -> Result<(), String> {
    let existing = load_settings(connection, user_id)?;

    let resolve = |submitted: &Option<String>, stored: Option<&str>| -> Option<String> {
        match submitted.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => Some(cipher.encrypt(value)),
            _ => stored.map(|v| v.to_string()),
        }
    };

    let preferred = match input.preferred_provider.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => ProviderKind::parse(value)?.as_str().to_string(),
        _ => existing
            .as_ref()
            .map(|row| row.preferred_provider.clone())
            .unwrap_or_else(|| DEFAULT_PREFERRED_PROVIDER.as_str().to_string()),
    };
    let telemetry_enabled = input
        .telemetry_enabled
        .or(existing.as_ref().map(|row| row.telemetry_enabled))
        .unwrap_or(true);

    let existing_key =
        |provider: ProviderKind| existing.as_ref().and_then(|row| row.encrypted_key_for(provider));

    connection
        .execute(
            "INSERT INTO user_settings (
               user_id, encrypted_openai_key, encrypted_gemini_key, encrypted_groq_key,
               encrypted_anthropic_key, encrypted_perplexity_key, preferred_provider,
               telemetry_enabled, updated_at_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id) DO UPDATE SET
               encrypted_openai_key = excluded.encrypted_openai_key,
               encrypted_gemini_key = excluded.encrypted_gemini_key,
               encrypted_groq_key = excluded.encrypted_groq_key,
               encrypted_anthropic_key = excluded.encrypted_anthropic_key,
               encrypted_perplexity_key = excluded.encrypted_perplexity_key,
               preferred_provider = excluded.preferred_provider,
               telemetry_enabled = excluded.telemetry_enabled,
               updated_at_ms = excluded.updated_at_ms",
            params![
                user_id,
                resolve(&input.openai_key, existing_key(ProviderKind::OpenAi)),
                resolve(&input.gemini_key, existing_key(ProviderKind::Gemini)),
                resolve(&input.groq_key, existing_key(ProviderKind::Groq)),
                resolve(&input.anthropic_key, existing_key(ProviderKind::Anthropic)),
                resolve(&input.perplexity_key, existing_key(ProviderKind::Sonar)),
                preferred,
                telemetry_enabled,
                now_ms()
            ],
        )
        .map_err(|e| format!("Failed to save vault: {e}"))?;
    Ok(())
}

/// Selection order: an explicitly requested provider must have a stored key
/// (no silent fallback); otherwise the preferred provider, then the first
/// provider with any stored key. Callers fail fast on `Err` before creating
/// any run row.
pub fn resolve_credential(
    settings: &SettingsRow,
    requested: Option<ProviderKind>,
) -> Result<ResolvedCredential, String> {
    if let Some(provider) = requested {
        return match settings.encrypted_key_for(provider) {
            Some(key) => Ok(ResolvedCredential {
                provider,
                encrypted_key: key.to_string(),
            }),
            None => Err(format!(
                "Access Denied: No encrypted key found for {}.",
                provider.as_str().to_uppercase()
            )),
        };
    }

    let preferred = ProviderKind::parse(&settings.preferred_provider).ok();
    if let Some(provider) = preferred {
        if let Some(key) = settings.encrypted_key_for(provider) {
            return Ok(ResolvedCredential {
                provider,
                encrypted_key: key.to_string(),
            });
        }
    }
    if let Some(provider) = settings.first_stored_provider() {
        if let Some(key) = settings.encrypted_key_for(provider) {
            return Ok(ResolvedCredential {
                provider,
                encrypted_key: key.to_string(),
            });
        }
    }
    Err("Access Denied: No provider key is stored in the vault.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap_schema;
    use pretty_assertions::assert_eq;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open");
        bootstrap_schema(&mut conn).expect("bootstrap");
        conn
    }

    fn test_cipher() -> VaultCipher {
        VaultCipher::from_master_secret("unit-test-master-secret").expect("cipher")
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let cipher = test_cipher();
        for plaintext in ["sk-test-123", "", "unicode ключ 密钥"] {
            let encrypted = cipher.encrypt(plaintext);
            assert!(encrypted.contains(':'));
            assert_eq!(cipher.decrypt(&encrypted).as_deref(), Some(plaintext));
        }
    }

    #[test]
    fn encrypt_uses_a_fresh_iv_per_call() {
        let cipher = test_cipher();
        assert_ne!(cipher.encrypt("same-input"), cipher.encrypt("same-input"));
    }

    #[test]
    fn decrypt_returns_none_instead_of_failing() {
        let cipher = test_cipher();
        assert_eq!(cipher.decrypt("no-separator"), None);
        assert_eq!(cipher.decrypt("zz:zz"), None);
        assert_eq!(cipher.decrypt("00ff:00ff"), None);

        let other = VaultCipher::from_master_secret("different-secret").expect("cipher");
        let encrypted = cipher.encrypt("sk-test-123");
        assert_eq!(other.decrypt(&encrypted), None);
    }

    #[test]
    fn master_secret_is_required() {
        assert!(VaultCipher::from_master_secret("  ").is_err());
    }

    #[test]
    fn save_vault_keeps_unsubmitted_slots_byte_identical() {
        let conn = test_conn();
        let cipher = test_cipher();

        save_vault(
            &conn,
            &cipher,
            "user_1",
            &SaveVaultInput {
                openai_key: Some("sk-openai".to_string()),
                ..Default::default()
            },
        )
        .expect("first save");
        let stored_openai = load_settings(&conn, "user_1")
            .expect("load")
            .expect("row")
            .encrypted_openai_key
            .expect("openai ciphertext");

        save_vault(
            &conn,
            &cipher,
            "user_1",
            &SaveVaultInput {
                openai_key: Some("   ".to_string()),
                groq_key: Some("gsk-groq".to_string()),
                ..Default::default()
            },
        )
        .expect("second save");

        let row = load_settings(&conn, "user_1").expect("load").expect("row");
        assert_eq!(row.encrypted_openai_key.as_deref(), Some(stored_openai.as_str()));
        assert!(row.encrypted_groq_key.is_some());

        let status = vault_status(&conn, "user_1").expect("status");
        assert!(status.keys.openai);
        assert!(status.keys.groq);
        assert!(!status.keys.gemini);
    }

    #[test]
    fn vault_status_defaults_when_no_row_exists() {
        let conn = test_conn();
        let status = vault_status(&conn, "user_missing").expect("status");
        assert!(!status.keys.openai && !status.keys.sonar);
        assert_eq!(status.preferred, "gemini");
        assert!(status.telemetry_enabled);
    }

    #[test]
    fn resolve_credential_honors_request_then_preference_then_first() {
        let mut settings = SettingsRow {
            user_id: "user_1".to_string(),
            encrypted_openai_key: Some("aa:bb".to_string()),
            encrypted_gemini_key: None,
            encrypted_groq_key: Some("cc:dd".to_string()),
            encrypted_anthropic_key: None,
            encrypted_perplexity_key: None,
            preferred_provider: "groq".to_string(),
            telemetry_enabled: true,
            updated_at_ms: 0,
        };

        let explicit = resolve_credential(&settings, Some(ProviderKind::OpenAi)).expect("explicit");
        assert_eq!(explicit.provider, ProviderKind::OpenAi);

        let preferred = resolve_credential(&settings, None).expect("preferred");
        assert_eq!(preferred.provider, ProviderKind::Groq);

        settings.preferred_provider = "gemini".to_string();
        let fallback = resolve_credential(&settings, None).expect("fallback");
        assert_eq!(fallback.provider, ProviderKind::OpenAi);
    }

    #[test]
    fn requested_provider_without_key_is_a_hard_failure() {
        let settings = SettingsRow {
            user_id: "user_1".to_string(),
            encrypted_openai_key: Some("aa:bb".to_string()),
            encrypted_gemini_key: None,
            encrypted_groq_key: None,
            encrypted_anthropic_key: None,
            encrypted_perplexity_key: None,
            preferred_provider: "openai".to_string(),
            telemetry_enabled: true,
            updated_at_ms: 0,
        };
        let err = resolve_credential(&settings, Some(ProviderKind::Groq)).expect_err("denied");
        assert_eq!(err, "Access Denied: No encrypted key found for GROQ.");
    }
}
