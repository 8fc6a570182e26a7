use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// One backend descriptor record
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Wire protocol spoken by the backend
    #[serde(rename = "type")]
    pub kind: BackendKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher priorities are tried first
    #[serde(default)]
    pub priority: i32,
    /// Base URL, defaults to the vendor endpoint for `openai` and `anthropic`
    #[serde(default)]
    pub base_url: Option<Url>,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Per-attempt timeout
    #[serde(default = "default_timeout", deserialize_with = "crate::duration::deserialize")]
    pub timeout: Duration,
    /// Models served by this backend
    #[serde(default)]
    pub models: Vec<String>,
    /// Model sent upstream when the requested one is not served
    #[serde(default)]
    pub default_model: Option<String>,
    /// Prepend a fixed tool-call exemplar to tool requests
    #[serde(default)]
    pub tool_priming: bool,
}

impl BackendConfig {
    /// The model used when the requested one is not advertised
    pub fn effective_default_model(&self) -> Option<&str> {
        self.default_model.as_deref().or_else(|| self.models.first().map(String::as_str))
    }
}

/// Supported backend protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// OpenAI-compatible chat completions
    Openai,
    /// Anthropic Messages API
    Anthropic,
    /// Stateful conversation API driven by continuation tokens
    Threaded,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Threaded => "threaded",
        }
    }

    /// Whether the backend reconstructs context server-side
    pub const fn is_stateful(self) -> bool {
        matches!(self, Self::Threaded)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[allow(clippy::missing_const_for_fn)]
fn default_enabled() -> bool {
    true
}

const fn default_timeout() -> Duration {
    Duration::from_secs(60)
}
