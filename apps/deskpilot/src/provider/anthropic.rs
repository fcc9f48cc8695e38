use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;
use url::Url;

use super::{
    ActionAdapter, FunctionCall, ProviderClient, ProviderError, ProviderId, ProviderRequest,
    ProviderResponse, SYSTEM_INSTRUCTION, TranslateContext, TranslateError, Turn, arg_f64,
    arg_str, http_client, parse_base_url, read_json,
};
use crate::coords::MODEL_EXTENT;
use crate::keys::split_combo;
use crate::protocol::{
    CanonicalCommand, DEFAULT_SCROLL_AMOUNT, Extent, MouseButton, ScrollDirection, Target,
};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/";
pub const API_KEY_ENV: &str = "CLAUDE_API_KEY";
const API_VERSION: &str = "2023-06-01";
const COMPUTER_USE_BETA: &str = "computer-use-2025-01-24";
const COMPUTER_TOOL: &str = "computer";
const MAX_TOKENS: u32 = 1024;
const FALLBACK_IMAGE: Extent = Extent {
    width: 1920,
    height: 1080,
};

/// Translates the `computer` tool. Coordinates arrive in screenshot pixels
/// and are rescaled onto the 0..1000 grid.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    fn point(
        call: &FunctionCall,
        key: &'static str,
        image: Extent,
    ) -> Result<Option<Target>, TranslateError> {
        let Some(raw) = call.args.get(key) else {
            return Ok(None);
        };
        let pair = raw
            .as_array()
            .filter(|pair| pair.len() == 2)
            .and_then(|pair| Some((pair[0].as_f64()?, pair[1].as_f64()?)))
            .ok_or_else(|| missing(call, key))?;
        Ok(Some(Target::model(
            rescale(pair.0, image.width),
            rescale(pair.1, image.height),
        )))
    }

    fn required(
        call: &FunctionCall,
        key: &'static str,
        image: Extent,
    ) -> Result<Target, TranslateError> {
        Self::point(call, key, image)?.ok_or_else(|| missing(call, key))
    }
}

fn rescale(value: f64, dimension: u32) -> f64 {
    (value / f64::from(dimension.max(1)) * MODEL_EXTENT).round()
}

fn missing(call: &FunctionCall, field: &'static str) -> TranslateError {
    TranslateError::MissingArgument {
        action: call.name.clone(),
        field,
    }
}

impl ActionAdapter for AnthropicAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn translate(
        &self,
        call: &FunctionCall,
        ctx: &TranslateContext,
    ) -> Result<Vec<CanonicalCommand>, TranslateError> {
        let image = ctx.image_size.unwrap_or(FALLBACK_IMAGE);
        let args = &call.args;
        let action = arg_str(args, "action").unwrap_or(call.name.as_str());
        // A click that names a coordinate moves there first; without one it
        // clicks wherever the pointer is.
        let click = |button: MouseButton| -> Result<CanonicalCommand, TranslateError> {
            Ok(CanonicalCommand::Click {
                button,
                at: Self::point(call, "coordinate", image)?,
            })
        };
        let command = match action {
            "mouse_move" => CanonicalCommand::Move {
                to: Self::required(call, "coordinate", image)?,
            },
            "left_click" => click(MouseButton::Left)?,
            "right_click" => click(MouseButton::Right)?,
            "middle_click" => click(MouseButton::Middle)?,
            "double_click" => CanonicalCommand::DoubleClick {
                button: MouseButton::Left,
                at: Self::point(call, "coordinate", image)?,
            },
            "left_mouse_down" => CanonicalCommand::MouseDown {
                button: MouseButton::Left,
                at: Self::point(call, "coordinate", image)?,
            },
            "left_mouse_up" => CanonicalCommand::MouseUp {
                button: MouseButton::Left,
                at: Self::point(call, "coordinate", image)?,
            },
            "left_click_drag" => CanonicalCommand::Drag {
                source: Self::point(call, "start_coordinate", image)?,
                destination: Self::required(call, "coordinate", image)?,
                button: MouseButton::Left,
            },
            "type" => CanonicalCommand::Type {
                text: arg_str(args, "text")
                    .ok_or_else(|| missing(call, "text"))?
                    .to_string(),
            },
            "key" => CanonicalCommand::KeyCombination {
                keys: split_combo(arg_str(args, "text").ok_or_else(|| missing(call, "text"))?),
            },
            "scroll" => {
                let direction: ScrollDirection = arg_str(args, "scroll_direction")
                    .and_then(|raw| serde_json::from_value(json!(raw.to_ascii_lowercase())).ok())
                    .ok_or_else(|| missing(call, "scroll_direction"))?;
                let amount = args
                    .get("scroll_amount")
                    .and_then(Value::as_i64)
                    .map(|amount| amount.clamp(1, i64::from(i32::MAX)) as i32)
                    .unwrap_or(DEFAULT_SCROLL_AMOUNT);
                let (dx, dy) = direction.deltas(amount);
                CanonicalCommand::Scroll {
                    dx,
                    dy,
                    at: Self::point(call, "coordinate", image)?,
                }
            }
            "wait" => {
                let seconds = arg_f64(args, "duration").unwrap_or(1.0).max(0.0);
                CanonicalCommand::Wait {
                    ms: (seconds * 1000.0).round() as u64,
                }
            }
            "screenshot" => CanonicalCommand::CaptureScreenshot { request_id: None },
            "cursor_position" => {
                warn!("cursor_position has no canonical command; ignoring");
                return Ok(Vec::new());
            }
            other => return Err(TranslateError::UnrecognizedAction(other.to_string())),
        };
        Ok(vec![command])
    }
}

/// Messages API client with the computer-use beta tool.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: Url,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>, model: Option<&str>) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey(API_KEY_ENV));
        }
        let model = match model.map(str::trim) {
            None | Some("") | Some("claude") | Some("anthropic") => DEFAULT_MODEL.to_string(),
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

    fn build_body(&self, request: &ProviderRequest) -> Value {
        let image = request.image_size.unwrap_or(FALLBACK_IMAGE);
        let mut messages: Vec<Value> = request
            .history
            .iter()
            .map(|turn| {
                let role = if turn.role == "model" { "assistant" } else { "user" };
                let text = turn.joined_text();
                json!({
                    "role": role,
                    "content": if text.is_empty() { " ".to_string() } else { text },
                })
            })
            .collect();

        let mut content = vec![json!({ "type": "text", "text": request.prompt })];
        if let Some(data) = &request.screenshot {
            content.push(json!({
                "type": "image",
                "source": { "type": "base64", "media_type": "image/jpeg", "data": data },
            }));
        }
        messages.push(json!({ "role": "user", "content": content }));

        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": SYSTEM_INSTRUCTION,
            "tools": [{
                "type": "computer_20250124",
                "name": COMPUTER_TOOL,
                "display_width_px": image.width,
                "display_height_px": image.height,
            }],
            "messages": messages,
        })
    }

    fn parse_response(
        body: &Value,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        let blocks = body
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Malformed("missing `content`".into()))?;

        let mut texts = Vec::new();
        let mut function_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        texts.push(text.to_string());
                    }
                }
                Some("tool_use") if block.get("name").and_then(Value::as_str) == Some(COMPUTER_TOOL) => {
                    let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    let name = arg_str(&input, "action").unwrap_or_default().to_string();
                    function_calls.push(FunctionCall::new(name, input));
                }
                _ => {}
            }
        }
        let text = texts.join("\n");

        let mut history = request.history.clone();
        history.push(Turn::text("user", request.prompt.clone()));
        history.push(Turn::text("model", text.clone()));
        Ok(ProviderResponse {
            text,
            function_calls,
            history,
        })
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn infer(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let endpoint = self
            .base_url
            .join("v1/messages")
            .map_err(|err| ProviderError::InvalidConfig(err.to_string()))?;
        let body = self.build_body(request);
        tracing::debug!(model = %self.model, turns = request.history.len(), "anthropic request");
        let response = self
            .http
            .post(endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", COMPUTER_USE_BETA)
            .json(&body)
            .send()
            .await?;
        let payload = read_json(response).await?;
        Self::parse_response(&payload, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::HeaderMap, routing::post};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn translate_in(
        args: Value,
        image: Option<Extent>,
    ) -> Result<Vec<CanonicalCommand>, TranslateError> {
        let name = args["action"].as_str().unwrap_or_default().to_string();
        AnthropicAdapter.translate(
            &FunctionCall::new(name, args),
            &TranslateContext { image_size: image },
        )
    }

    fn translate(args: Value) -> Result<Vec<CanonicalCommand>, TranslateError> {
        translate_in(args, Some(Extent::new(1280, 800)))
    }

    #[test]
    fn pixel_coordinates_are_rescaled_to_the_model_grid() {
        assert_eq!(
            translate(json!({"action": "left_click", "coordinate": [640, 400]})).unwrap(),
            vec![CanonicalCommand::Click {
                button: MouseButton::Left,
                at: Some(Target::model(500.0, 500.0)),
            }]
        );
        assert_eq!(
            translate_in(json!({"action": "mouse_move", "coordinate": [960, 270]}), None).unwrap(),
            vec![CanonicalCommand::Move {
                to: Target::model(500.0, 250.0),
            }]
        );
        assert!(matches!(
            translate(json!({"action": "mouse_move"})),
            Err(TranslateError::MissingArgument {
                field: "coordinate",
                ..
            })
        ));
    }

    #[test]
    fn clicks_move_only_when_given_a_coordinate() {
        assert_eq!(
            translate(json!({"action": "left_click"})).unwrap(),
            vec![CanonicalCommand::Click {
                button: MouseButton::Left,
                at: None,
            }]
        );
        assert_eq!(
            translate(json!({"action": "right_click", "coordinate": [0, 800]})).unwrap(),
            vec![CanonicalCommand::Click {
                button: MouseButton::Right,
                at: Some(Target::model(0.0, 1000.0)),
            }]
        );
    }

    #[test]
    fn drag_keys_and_typing() {
        assert_eq!(
            translate(json!({
                "action": "left_click_drag",
                "start_coordinate": [0, 0],
                "coordinate": [1280, 800]
            }))
            .unwrap(),
            vec![CanonicalCommand::Drag {
                source: Some(Target::model(0.0, 0.0)),
                destination: Target::model(1000.0, 1000.0),
                button: MouseButton::Left,
            }]
        );
        assert_eq!(
            translate(json!({"action": "key", "text": "ctrl+shift+t"})).unwrap(),
            vec![CanonicalCommand::KeyCombination {
                keys: vec!["ctrl".into(), "shift".into(), "t".into()],
            }]
        );
        assert_eq!(
            translate(json!({"action": "type", "text": "hello"})).unwrap(),
            vec![CanonicalCommand::Type {
                text: "hello".into(),
            }]
        );
    }

    #[test]
    fn scroll_wait_and_screenshot() {
        assert_eq!(
            translate(json!({"action": "scroll", "scroll_direction": "up", "scroll_amount": 5}))
                .unwrap(),
            vec![CanonicalCommand::Scroll {
                dx: 0,
                dy: -5,
                at: None,
            }]
        );
        assert_eq!(
            translate(json!({"action": "wait", "duration": 2})).unwrap(),
            vec![CanonicalCommand::Wait { ms: 2_000 }]
        );
        assert_eq!(
            translate(json!({"action": "screenshot"})).unwrap(),
            vec![CanonicalCommand::CaptureScreenshot { request_id: None }]
        );
        assert_eq!(translate(json!({"action": "cursor_position"})).unwrap(), vec![]);
        assert_eq!(
            translate(json!({"action": "zoom"})),
            Err(TranslateError::UnrecognizedAction("zoom".into()))
        );
    }

    #[test]
    fn history_is_flattened_to_text_messages() {
        let client = AnthropicClient::new("k", None).unwrap();
        let request = ProviderRequest {
            prompt: "continue".into(),
            history: vec![Turn::text("user", "open mail"), Turn::text("model", "")],
            screenshot: Some("aW1n".into()),
            image_size: Some(Extent::new(1280, 800)),
        };
        let body = client.build_body(&request);
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["messages"][1]["content"], " ");
        assert_eq!(body["messages"][2]["content"][1]["source"]["data"], "aW1n");
        assert_eq!(body["tools"][0]["display_width_px"], 1280);
        assert_eq!(body["model"], DEFAULT_MODEL);
    }

    #[test_timeout::tokio_timeout_test]
    async fn infer_sends_beta_headers_and_collects_tool_calls() {
        let seen: Arc<Mutex<Option<HeaderMap>>> = Arc::new(Mutex::new(None));
        let capture = Arc::clone(&seen);
        let app = Router::new().route(
            "/v1/messages",
            post(move |headers: HeaderMap, Json(_body): Json<Value>| {
                let capture = Arc::clone(&capture);
                async move {
                    *capture.lock().await = Some(headers);
                    Json(json!({
                        "content": [
                            {"type": "text", "text": "Opening the menu."},
                            {"type": "tool_use", "id": "t1", "name": "computer",
                             "input": {"action": "left_click", "coordinate": [10, 10]}},
                            {"type": "text", "text": "DONE"}
                        ]
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = AnthropicClient::new("secret", None)
            .unwrap()
            .with_base_url(&format!("http://{addr}"))
            .unwrap();
        let response = client
            .infer(&ProviderRequest {
                prompt: "open the menu".into(),
                ..ProviderRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(response.text, "Opening the menu.\nDONE");
        assert_eq!(response.function_calls.len(), 1);
        assert_eq!(response.function_calls[0].name, "left_click");
        assert_eq!(response.history.len(), 2);

        let headers = seen.lock().await.clone().unwrap();
        assert_eq!(headers["x-api-key"], "secret");
        assert_eq!(headers["anthropic-version"], API_VERSION);
        assert_eq!(headers["anthropic-beta"], COMPUTER_USE_BETA);
    }
}
