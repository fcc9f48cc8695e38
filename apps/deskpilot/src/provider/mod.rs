//! Vision-language model providers: HTTP clients that run one inference turn
//! and adapters that translate their native tool calls into canonical
//! commands.

pub mod anthropic;
pub mod gemini;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::protocol::{CanonicalCommand, Extent};

pub use anthropic::{AnthropicAdapter, AnthropicClient};
pub use gemini::{GeminiAdapter, GeminiClient};

/// Instruction given to every provider so runs can terminate on their own.
pub const SYSTEM_INSTRUCTION: &str = "You are a computer use agent. Your goal is to help the user control their computer to accomplish tasks. Critical: When the user's task is complete, you MUST include the word \"DONE\" in your response to terminate the session.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ProviderId {
    Gemini,
    Anthropic,
}

impl ProviderId {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Gemini => "gemini",
            ProviderId::Anthropic => "anthropic",
        }
    }

    /// Best guess from a model name such as `claude-sonnet-4-5` or
    /// `gemini-2.5-computer-use-preview`.
    pub fn for_model(model: &str) -> Option<Self> {
        let lowered = model.to_ascii_lowercase();
        if lowered.contains("gemini") {
            Some(ProviderId::Gemini)
        } else if lowered.contains("claude") || lowered.contains("anthropic") {
            Some(ProviderId::Anthropic)
        } else {
            None
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// One conversation turn in the provider-neutral `{role, parts}` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Value>,
}

impl Turn {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            parts: vec![serde_json::json!({ "text": text.into() })],
        }
    }

    /// Text parts joined with single spaces.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub prompt: String,
    pub history: Vec<Turn>,
    /// Base64 JPEG of the current screen.
    pub screenshot: Option<String>,
    /// Pixel size of `screenshot`.
    pub image_size: Option<Extent>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
    /// Authoritative history to send with the next request.
    pub history: Vec<Turn>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0} is not set")]
    MissingApiKey(&'static str),
    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn infer(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TranslateContext {
    /// Size of the screenshot the provider saw, for pixel-based providers.
    pub image_size: Option<Extent>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TranslateError {
    #[error("unrecognized action `{0}`")]
    UnrecognizedAction(String),
    #[error("`{action}` is missing `{field}`")]
    MissingArgument { action: String, field: &'static str },
}

pub trait ActionAdapter: Send + Sync {
    fn provider(&self) -> ProviderId;

    /// Pure translation of one native call. Actions that need no command
    /// translate to an empty list.
    fn translate(
        &self,
        call: &FunctionCall,
        ctx: &TranslateContext,
    ) -> Result<Vec<CanonicalCommand>, TranslateError>;
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderId, Arc<dyn ActionAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GeminiAdapter));
        registry.register(Arc::new(AnthropicAdapter));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ActionAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: ProviderId) -> Option<Arc<dyn ActionAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    /// Translates a whole response, dropping calls that cannot be translated.
    pub fn translate_all(
        adapter: &dyn ActionAdapter,
        calls: &[FunctionCall],
        ctx: &TranslateContext,
    ) -> Vec<CanonicalCommand> {
        let mut commands = Vec::new();
        for call in calls {
            match adapter.translate(call, ctx) {
                Ok(translated) => commands.extend(translated),
                Err(err) => warn!(
                    provider = adapter.provider().as_str(),
                    action = %call.name,
                    error = %err,
                    "dropping provider action"
                ),
            }
        }
        commands
    }
}

pub(crate) fn http_client() -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(5))
        .timeout(std::time::Duration::from_secs(120))
        .build()?)
}

pub(crate) fn parse_base_url(raw: &str) -> Result<url::Url, ProviderError> {
    let mut base = raw.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    url::Url::parse(&base)
        .map_err(|err| ProviderError::InvalidConfig(format!("invalid base url: {err}")))
}

pub(crate) async fn read_json(response: reqwest::Response) -> Result<Value, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::HttpStatus { status, body });
    }
    Ok(response.json::<Value>().await?)
}

pub(crate) fn arg_f64(args: &Value, key: &str) -> Option<f64> {
    args.get(key).and_then(Value::as_f64)
}

pub(crate) fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MouseButton;
    use serde_json::json;

    #[test]
    fn model_names_map_to_providers() {
        assert_eq!(
            ProviderId::for_model("gemini-2.5-computer-use-preview-10-2025"),
            Some(ProviderId::Gemini)
        );
        assert_eq!(
            ProviderId::for_model("claude-sonnet-4-5-20250929"),
            Some(ProviderId::Anthropic)
        );
        assert_eq!(ProviderId::for_model("gpt-4o"), None);
    }

    #[test]
    fn registry_holds_both_default_adapters() {
        let registry = AdapterRegistry::with_defaults();
        assert_eq!(
            registry.get(ProviderId::Gemini).unwrap().provider(),
            ProviderId::Gemini
        );
        assert_eq!(
            registry.get(ProviderId::Anthropic).unwrap().provider(),
            ProviderId::Anthropic
        );
        assert!(AdapterRegistry::new().get(ProviderId::Gemini).is_none());
    }

    #[test]
    fn untranslatable_calls_are_dropped_not_fatal() {
        let registry = AdapterRegistry::with_defaults();
        let adapter = registry.get(ProviderId::Anthropic).unwrap();
        let calls = vec![
            FunctionCall::new("teleport", json!({})),
            FunctionCall::new("left_click", json!({"action": "left_click"})),
        ];
        let commands =
            AdapterRegistry::translate_all(adapter.as_ref(), &calls, &TranslateContext::default());
        assert_eq!(
            commands,
            vec![CanonicalCommand::Click {
                button: MouseButton::Left,
                at: None,
            }]
        );
    }

    #[test]
    fn turn_text_joins_text_parts() {
        let turn = Turn {
            role: "model".into(),
            parts: vec![
                json!({"text": "one"}),
                json!({"functionCall": {"name": "click_at"}}),
                json!({"text": "two"}),
            ],
        };
        assert_eq!(turn.joined_text(), "one two");
    }
}
