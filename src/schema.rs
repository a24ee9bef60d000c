use serde::{Deserialize, Serialize};

/// Supported AI providers. The wire names (lowercase) match the worker
/// payload contract; `sonar` keys live in the `encrypted_perplexity_key`
/// settings slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Groq,
    Anthropic,
    Sonar,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        Self::OpenAi,
        Self::Gemini,
        Self::Groq,
        Self::Anthropic,
        Self::Sonar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Groq => "groq",
            Self::Anthropic => "anthropic",
            Self::Sonar => "sonar",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            "groq" => Ok(Self::Groq),
            "anthropic" => Ok(Self::Anthropic),
            "sonar" => Ok(Self::Sonar),
            other => Err(format!("Unsupported provider: {other}")),
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::Gemini => "gemini-flash-latest",
            Self::Groq => "llama-3.3-70b-versatile",
            Self::Anthropic => "claude-3-5-sonnet-latest",
            Self::Sonar => "sonar",
        }
    }
}

pub const DEFAULT_PREFERRED_PROVIDER: ProviderKind = ProviderKind::Gemini;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Healed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Healed => "HEALED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "HEALED" => Ok(Self::Healed),
            other => Err(format!("Unknown run status: {other}")),
        }
    }

    /// Terminal statuses are the only ones telemetry propagates onto the
    /// run row; everything else stays log-level.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Healed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Sniper,
    Chaos,
    Scout,
    Replay,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sniper => "sniper",
            Self::Chaos => "chaos",
            Self::Scout => "scout",
            Self::Replay => "replay",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sniper" => Ok(Self::Sniper),
            "chaos" => Ok(Self::Chaos),
            "scout" => Ok(Self::Scout),
            "replay" => Ok(Self::Replay),
            other => Err(format!("Unknown run mode: {other}")),
        }
    }
}

/// One recorded browser action, as shipped to the worker for replay runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStep {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}
