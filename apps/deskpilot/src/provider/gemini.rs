use async_trait::async_trait;
use serde_json::{Value, json};
use url::Url;

use super::{
    ActionAdapter, FunctionCall, ProviderClient, ProviderError, ProviderId, ProviderRequest,
    ProviderResponse, SYSTEM_INSTRUCTION, TranslateContext, TranslateError, Turn, arg_f64,
    arg_str, http_client, parse_base_url, read_json,
};
use crate::keys::split_combo;
use crate::protocol::{CanonicalCommand, MouseButton, ScrollDirection, Target, WireCommand};

pub const DEFAULT_MODEL: &str = "gemini-2.5-computer-use-preview-10-2025";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

const SEARCH_HOME: &str = "https://www.google.com";
/// Wheel notches for a whole-document scroll.
const DOCUMENT_SCROLL_NOTCHES: i32 = 10;
const DEFAULT_SCROLL_MAGNITUDE: f64 = 800.0;

/// Translates the computer-use tool. Coordinates already use the 0..1000 grid.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiAdapter;

impl GeminiAdapter {
    fn target(call: &FunctionCall, x: &str, y: &str) -> Result<Target, TranslateError> {
        match (arg_f64(&call.args, x), arg_f64(&call.args, y)) {
            (Some(x), Some(y)) => Ok(Target::model(x, y)),
            (None, _) => Err(missing(call, "x")),
            (Some(_), None) => Err(missing(call, "y")),
        }
    }

    fn direction(call: &FunctionCall) -> Result<ScrollDirection, TranslateError> {
        let raw = arg_str(&call.args, "direction").ok_or_else(|| missing(call, "direction"))?;
        serde_json::from_value(json!(raw.to_ascii_lowercase()))
            .map_err(|_| missing(call, "direction"))
    }

    fn keys(combo: &[&str]) -> CanonicalCommand {
        CanonicalCommand::KeyCombination {
            keys: combo.iter().map(|key| key.to_string()).collect(),
        }
    }
}

fn missing(call: &FunctionCall, field: &'static str) -> TranslateError {
    TranslateError::MissingArgument {
        action: call.name.clone(),
        field,
    }
}

impl ActionAdapter for GeminiAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn translate(
        &self,
        call: &FunctionCall,
        _ctx: &TranslateContext,
    ) -> Result<Vec<CanonicalCommand>, TranslateError> {
        let args = &call.args;
        let commands = match call.name.as_str() {
            "click_at" => vec![CanonicalCommand::Click {
                button: MouseButton::Left,
                at: Some(Self::target(call, "x", "y")?),
            }],
            "hover_at" => vec![CanonicalCommand::Move {
                to: Self::target(call, "x", "y")?,
            }],
            "type_text_at" => {
                let text = arg_str(args, "text").ok_or_else(|| missing(call, "text"))?;
                let press_enter = args
                    .get("press_enter")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let clear = args
                    .get("clear_before_typing")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                let mut commands = vec![CanonicalCommand::Click {
                    button: MouseButton::Left,
                    at: Some(Self::target(call, "x", "y")?),
                }];
                if clear {
                    commands.push(Self::keys(&["control", "a"]));
                    commands.push(Self::keys(&["backspace"]));
                }
                commands.push(CanonicalCommand::Type {
                    text: text.to_string(),
                });
                if press_enter {
                    commands.push(Self::keys(&["enter"]));
                }
                commands
            }
            "key_combination" => {
                let raw = arg_str(args, "keys").ok_or_else(|| missing(call, "keys"))?;
                vec![CanonicalCommand::KeyCombination {
                    keys: split_combo(raw),
                }]
            }
            "scroll_document" => {
                let (dx, dy) = Self::direction(call)?.deltas(DOCUMENT_SCROLL_NOTCHES);
                vec![CanonicalCommand::Scroll { dx, dy, at: None }]
            }
            "scroll_at" => {
                let magnitude = arg_f64(args, "magnitude").unwrap_or(DEFAULT_SCROLL_MAGNITUDE);
                let notches = ((magnitude / 100.0).round() as i32).max(1);
                let (dx, dy) = Self::direction(call)?.deltas(notches);
                vec![CanonicalCommand::Scroll {
                    dx,
                    dy,
                    at: Some(Self::target(call, "x", "y")?),
                }]
            }
            "drag_and_drop" => vec![CanonicalCommand::Drag {
                source: Some(Self::target(call, "x", "y")?),
                destination: Self::target(call, "destination_x", "destination_y")?,
                button: MouseButton::Left,
            }],
            "navigate" => vec![CanonicalCommand::Navigate {
                url: arg_str(args, "url")
                    .ok_or_else(|| missing(call, "url"))?
                    .to_string(),
            }],
            "open_web_browser" => vec![CanonicalCommand::OpenBrowser {
                url: arg_str(args, "url").map(str::to_string),
            }],
            "search" => match arg_str(args, "query").filter(|q| !q.is_empty()) {
                Some(query) => vec![CanonicalCommand::Search {
                    query: query.to_string(),
                }],
                None => vec![CanonicalCommand::Navigate {
                    url: SEARCH_HOME.to_string(),
                }],
            },
            "wait_5_seconds" => vec![CanonicalCommand::Wait { ms: 5_000 }],
            "go_back" => vec![Self::keys(&["alt", "left"])],
            "go_forward" => vec![Self::keys(&["alt", "right"])],
            other => {
                // Canonical command names are accepted as-is.
                let mut wire = args.clone();
                if !wire.is_object() {
                    wire = json!({});
                }
                wire["type"] = json!(other);
                let wire: WireCommand = serde_json::from_value(wire)
                    .map_err(|_| TranslateError::UnrecognizedAction(other.to_string()))?;
                let command = CanonicalCommand::try_from(wire)
                    .map_err(|_| TranslateError::UnrecognizedAction(other.to_string()))?;
                vec![command]
            }
        };
        Ok(commands)
    }
}

/// `generateContent` client with the computer-use tool enabled.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: Url,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: Option<&str>) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey(API_KEY_ENV));
        }
        let model = match model.map(str::trim) {
            None | Some("") | Some("gemini") => DEFAULT_MODEL.to_string(),
            Some(name) => name.to_string(),
        };
        Ok(Self {
            http: http_client()?,
            api_key,
            model,
            base_url: parse_base_url(DEFAULT_BASE_URL)?,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, ProviderError> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// History plus the new user turn. Function calls from the previous
    /// model turn are acknowledged before the prompt.
    fn build_contents(request: &ProviderRequest) -> Vec<Turn> {
        let mut contents = request.history.clone();
        let mut parts = Vec::new();
        if let Some(last) = contents.last().filter(|turn| turn.role == "model") {
            for part in &last.parts {
                if let Some(name) = part
                    .get("functionCall")
                    .and_then(|call| call.get("name"))
                    .and_then(Value::as_str)
                {
                    parts.push(json!({
                        "functionResponse": {
                            "name": name,
                            "response": { "status": "executed" },
                        }
                    }));
                }
            }
        }
        parts.push(json!({ "text": request.prompt }));
        if let Some(image) = &request.screenshot {
            parts.push(json!({
                "inlineData": { "mimeType": "image/jpeg", "data": image }
            }));
        }
        contents.push(Turn {
            role: "user".into(),
            parts,
        });
        contents
    }

    fn parse_response(body: &Value, mut contents: Vec<Turn>) -> Result<ProviderResponse, ProviderError> {
        let content = body
            .pointer("/candidates/0/content")
            .ok_or_else(|| {
                let reason = body
                    .pointer("/promptFeedback/blockReason")
                    .and_then(Value::as_str)
                    .unwrap_or("no candidates");
                ProviderError::Malformed(reason.to_string())
            })?;
        let mut turn: Turn = serde_json::from_value(json!({
            "role": content.get("role").cloned().unwrap_or_else(|| json!("model")),
            "parts": content.get("parts").cloned().unwrap_or_else(|| json!([])),
        }))
        .map_err(|err| ProviderError::Malformed(err.to_string()))?;
        if turn.role.is_empty() {
            turn.role = "model".into();
        }

        let function_calls = turn
            .parts
            .iter()
            .filter_map(|part| part.get("functionCall"))
            .filter_map(|call| serde_json::from_value::<FunctionCall>(call.clone()).ok())
            .collect();
        let text = turn.joined_text();
        contents.push(turn);
        Ok(ProviderResponse {
            text,
            function_calls,
            history: contents,
        })
    }
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    async fn infer(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let endpoint = self
            .base_url
            .join(&format!("v1beta/models/{}:generateContent", self.model))
            .map_err(|err| ProviderError::InvalidConfig(err.to_string()))?;
        let contents = Self::build_contents(request);
        let body = json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_INSTRUCTION }] },
            "contents": contents,
            "tools": [{ "computerUse": { "environment": "ENVIRONMENT_BROWSER" } }],
        });
        tracing::debug!(model = %self.model, turns = contents.len(), "gemini request");
        let response = self
            .http
            .post(endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let payload = read_json(response).await?;
        Self::parse_response(&payload, contents)
    }
}
