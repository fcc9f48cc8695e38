//! Messages exchanged between controllers and agents on a machine channel.
//!
//! Everything travels as JSON under the `command` event. A payload whose
//! `type` is `screenshot_response` answers a capture request; any other
//! payload is a command in the wire shape described by [`WireCommand`].

use chrono::{DateTime, Utc};
use deskpilot_bus::Member;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

pub const SCREENSHOT_RESPONSE: &str = "screenshot_response";

/// Wheel notches used when a scroll only names a direction.
pub const DEFAULT_SCROLL_AMOUNT: i32 = 3;
const DEFAULT_WAIT_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// The space a coordinate pair is expressed in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    /// 0..=1000 on both axes, top-left origin, independent of resolution.
    #[default]
    Model,
    /// Pixels of the captured framebuffer.
    Physical,
    /// OS pointer coordinates.
    Logical,
}

impl CoordinateSpace {
    pub fn as_str(self) -> &'static str {
        match self {
            CoordinateSpace::Model => "model",
            CoordinateSpace::Physical => "physical",
            CoordinateSpace::Logical => "logical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub point: Point,
    pub space: CoordinateSpace,
}

impl Target {
    pub fn model(x: f64, y: f64) -> Self {
        Self {
            point: Point::new(x, y),
            space: CoordinateSpace::Model,
        }
    }

    pub fn logical(x: f64, y: f64) -> Self {
        Self {
            point: Point::new(x, y),
            space: CoordinateSpace::Logical,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn as_str(self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    /// Wheel deltas for `amount` notches. Positive `dy` scrolls down.
    pub fn deltas(self, amount: i32) -> (i32, i32) {
        match self {
            ScrollDirection::Up => (0, -amount),
            ScrollDirection::Down => (0, amount),
            ScrollDirection::Left => (-amount, 0),
            ScrollDirection::Right => (amount, 0),
        }
    }
}

/// A provider-agnostic instruction for the agent. Immutable once published.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalCommand {
    Move {
        to: Target,
    },
    Click {
        button: MouseButton,
        at: Option<Target>,
    },
    DoubleClick {
        button: MouseButton,
        at: Option<Target>,
    },
    MouseDown {
        button: MouseButton,
        at: Option<Target>,
    },
    MouseUp {
        button: MouseButton,
        at: Option<Target>,
    },
    Type {
        text: String,
    },
    KeyCombination {
        keys: Vec<String>,
    },
    Scroll {
        dx: i32,
        dy: i32,
        at: Option<Target>,
    },
    Drag {
        source: Option<Target>,
        destination: Target,
        button: MouseButton,
    },
    Navigate {
        url: String,
    },
    OpenBrowser {
        url: Option<String>,
    },
    Search {
        query: String,
    },
    Wait {
        ms: u64,
    },
    CaptureScreenshot {
        request_id: Option<String>,
    },
}

impl CanonicalCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            CanonicalCommand::Move { .. } => "move",
            CanonicalCommand::Click { .. } => "click",
            CanonicalCommand::DoubleClick { .. } => "double_click",
            CanonicalCommand::MouseDown { .. } => "mouse_down",
            CanonicalCommand::MouseUp { .. } => "mouse_up",
            CanonicalCommand::Type { .. } => "type",
            CanonicalCommand::KeyCombination { .. } => "key_combination",
            CanonicalCommand::Scroll { .. } => "scroll",
            CanonicalCommand::Drag { .. } => "drag",
            CanonicalCommand::Navigate { .. } => "navigate",
            CanonicalCommand::OpenBrowser { .. } => "open_browser",
            CanonicalCommand::Search { .. } => "search",
            CanonicalCommand::Wait { .. } => "wait",
            CanonicalCommand::CaptureScreenshot { .. } => "capture_screenshot",
        }
    }

    pub fn to_wire(&self) -> WireCommand {
        let mut wire = WireCommand::of(self.kind());
        match self {
            CanonicalCommand::Move { to } => wire.set_target(*to),
            CanonicalCommand::Click { button, at }
            | CanonicalCommand::DoubleClick { button, at }
            | CanonicalCommand::MouseDown { button, at }
            | CanonicalCommand::MouseUp { button, at } => {
                wire.button = Some(*button);
                if let Some(at) = at {
                    wire.set_target(*at);
                }
            }
            CanonicalCommand::Type { text } => wire.text = Some(text.clone()),
            CanonicalCommand::KeyCombination { keys } => wire.keys = Some(keys.clone()),
            CanonicalCommand::Scroll { dx, dy, at } => {
                wire.dx = Some(*dx);
                wire.dy = Some(*dy);
                if let Some(at) = at {
                    wire.set_target(*at);
                }
            }
            CanonicalCommand::Drag {
                source,
                destination,
                button,
            } => {
                wire.button = Some(*button);
                wire.source = source.map(|s| s.point);
                wire.source_space = source
                    .map(|s| s.space)
                    .filter(|space| *space != destination.space);
                wire.destination = Some(destination.point);
                wire.space = Some(destination.space);
            }
            CanonicalCommand::Navigate { url } => wire.url = Some(url.clone()),
            CanonicalCommand::OpenBrowser { url } => wire.url = url.clone(),
            CanonicalCommand::Search { query } => wire.query = Some(query.clone()),
            CanonicalCommand::Wait { ms } => wire.ms = Some(*ms),
            CanonicalCommand::CaptureScreenshot { request_id } => {
                wire.request_id = request_id.clone()
            }
        }
        wire
    }

    pub fn to_payload(&self) -> Value {
        // WireCommand only holds plain optional fields, serialization cannot fail.
        serde_json::to_value(self.to_wire()).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("unrecognized command type `{0}`")]
    Unrecognized(String),
    #[error("`{kind}` command is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Flat JSON shape of a command as it travels on the channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireCommand {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<MouseButton>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<ScrollDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<CoordinateSpace>,
    /// Space of a drag's `source` when it differs from `space`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_space: Option<CoordinateSpace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dx: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dy: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl WireCommand {
    fn of(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            ..Self::default()
        }
    }

    fn set_target(&mut self, target: Target) {
        self.x = Some(target.point.x);
        self.y = Some(target.point.y);
        self.space = Some(target.space);
    }

    /// Legacy pointer messages carry OS pixels unless they say otherwise.
    fn default_space(&self) -> CoordinateSpace {
        match self.kind.as_str() {
            "mousemove" | "params" => CoordinateSpace::Logical,
            _ => CoordinateSpace::Model,
        }
    }

    fn target(&self) -> Option<Target> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some(Target {
                point: Point::new(x, y),
                space: self.space.unwrap_or_else(|| self.default_space()),
            }),
            _ => None,
        }
    }

    fn required_target(&self, kind: &'static str) -> Result<Target, CommandError> {
        self.target()
            .ok_or(CommandError::MissingField { kind, field: "x/y" })
    }

    fn required_text(&self, kind: &'static str, field: &'static str) -> Result<String, CommandError> {
        self.text
            .clone()
            .filter(|text| !text.is_empty())
            .ok_or(CommandError::MissingField { kind, field })
    }
}

impl TryFrom<WireCommand> for CanonicalCommand {
    type Error = CommandError;

    fn try_from(wire: WireCommand) -> Result<Self, Self::Error> {
        let button = wire.button.unwrap_or_default();
        let command = match wire.kind.as_str() {
            "move" | "hover" | "mousemove" | "params" => CanonicalCommand::Move {
                to: wire.required_target("move")?,
            },
            "click" => CanonicalCommand::Click {
                button,
                at: wire.target(),
            },
            "double_click" => CanonicalCommand::DoubleClick {
                button,
                at: wire.target(),
            },
            "mouse_down" => CanonicalCommand::MouseDown {
                button,
                at: wire.target(),
            },
            "mouse_up" => CanonicalCommand::MouseUp {
                button,
                at: wire.target(),
            },
            "type" => CanonicalCommand::Type {
                text: wire.required_text("type", "text")?,
            },
            "key_combination" | "key" => {
                let keys = match &wire.keys {
                    Some(keys) if !keys.is_empty() => keys.clone(),
                    _ => crate::keys::split_combo(&wire.required_text("key_combination", "keys")?),
                };
                CanonicalCommand::KeyCombination { keys }
            }
            "scroll" => {
                let (dx, dy) = match (wire.dx, wire.dy, wire.direction) {
                    (None, None, Some(direction)) => {
                        direction.deltas(wire.amount.unwrap_or(DEFAULT_SCROLL_AMOUNT))
                    }
                    (None, None, None) => {
                        return Err(CommandError::MissingField {
                            kind: "scroll",
                            field: "direction",
                        });
                    }
                    (dx, dy, _) => (dx.unwrap_or(0), dy.unwrap_or(0)),
                };
                CanonicalCommand::Scroll {
                    dx,
                    dy,
                    at: wire.target(),
                }
            }
            "drag" => {
                let space = wire.space.unwrap_or_default();
                let destination = match wire.destination {
                    Some(point) => Target { point, space },
                    None => wire.required_target("drag")?,
                };
                let source_space = wire.source_space.unwrap_or(space);
                CanonicalCommand::Drag {
                    source: wire.source.map(|point| Target {
                        point,
                        space: source_space,
                    }),
                    destination,
                    button,
                }
            }
            "navigate" => CanonicalCommand::Navigate {
                url: wire
                    .url
                    .clone()
                    .filter(|url| !url.is_empty())
                    .ok_or(CommandError::MissingField {
                        kind: "navigate",
                        field: "url",
                    })?,
            },
            "open_browser" => CanonicalCommand::OpenBrowser {
                url: wire.url.clone().filter(|url| !url.is_empty()),
            },
            "search" => CanonicalCommand::Search {
                query: match wire.query.clone().filter(|q| !q.is_empty()) {
                    Some(query) => query,
                    None => wire.required_text("search", "query")?,
                },
            },
            "wait" => CanonicalCommand::Wait {
                ms: wire.ms.unwrap_or(DEFAULT_WAIT_MS),
            },
            "capture_screenshot" | "screenshot" => CanonicalCommand::CaptureScreenshot {
                request_id: wire.request_id.clone(),
            },
            other => return Err(CommandError::Unrecognized(other.to_string())),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    #[serde(rename = "w")]
    pub width: u32,
    #[serde(rename = "h")]
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    pub x: i32,
    pub y: i32,
}

/// Geometry of the display a screenshot was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub original: Extent,
    pub logical: Extent,
    /// Size of the image actually sent to the model.
    pub scaled: Extent,
    pub scale_factor: f64,
    #[serde(default)]
    pub offset: Offset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotResponse {
    /// Base64 encoded JPEG.
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CaptureMetadata>,
}

impl ScreenshotResponse {
    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "type": SCREENSHOT_RESPONSE,
            "image": self.image,
        });
        if let Some(request_id) = &self.request_id {
            payload["request_id"] = json!(request_id);
        }
        if let Some(metadata) = &self.metadata {
            payload["metadata"] = serde_json::to_value(metadata).unwrap_or(Value::Null);
        }
        payload
    }
}

/// A `command` event payload after parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(CanonicalCommand),
    ScreenshotResponse(ScreenshotResponse),
}

pub fn parse_inbound(payload: &Value) -> Result<Inbound, CommandError> {
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CommandError::Malformed("missing `type`".into()))?;
    if kind == SCREENSHOT_RESPONSE {
        let response = serde_json::from_value(payload.clone())
            .map_err(|err| CommandError::Malformed(err.to_string()))?;
        return Ok(Inbound::ScreenshotResponse(response));
    }
    let wire: WireCommand = serde_json::from_value(payload.clone())
        .map_err(|err| CommandError::Malformed(err.to_string()))?;
    CanonicalCommand::try_from(wire).map(Inbound::Command)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Agent,
    Controller,
}

impl Role {
    pub fn of(member: &Member) -> Option<Role> {
        match member.meta.get("role").and_then(Value::as_str) {
            Some("agent") => Some(Role::Agent),
            Some("controller") => Some(Role::Controller),
            _ => None,
        }
    }
}

/// What each connection announces through presence tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl PresencePayload {
    pub fn new(role: Role, owner_id: Option<String>) -> Self {
        Self {
            role,
            owner_id,
            joined_at: Utc::now(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(payload: Value) -> Result<Inbound, CommandError> {
        parse_inbound(&payload)
    }

    #[test]
    fn click_without_coordinates_has_no_target() {
        let parsed = parse(json!({"type": "click", "button": "left"})).unwrap();
        assert_eq!(
            parsed,
            Inbound::Command(CanonicalCommand::Click {
                button: MouseButton::Left,
                at: None,
            })
        );
    }

    #[test]
    fn legacy_mousemove_defaults_to_logical_pixels() {
        let parsed = parse(json!({"type": "mousemove", "x": 500, "y": 500})).unwrap();
        assert_eq!(
            parsed,
            Inbound::Command(CanonicalCommand::Move {
                to: Target::logical(500.0, 500.0),
            })
        );
        let parsed = parse(json!({"type": "params", "x": 10, "y": 20, "space": "model"})).unwrap();
        assert_eq!(
            parsed,
            Inbound::Command(CanonicalCommand::Move {
                to: Target::model(10.0, 20.0),
            })
        );
    }

    #[test]
    fn hover_defaults_to_model_space() {
        let parsed = parse(json!({"type": "hover", "x": 1, "y": 2})).unwrap();
        assert_eq!(
            parsed,
            Inbound::Command(CanonicalCommand::Move {
                to: Target::model(1.0, 2.0),
            })
        );
    }

    #[test]
    fn key_text_is_split_into_a_combination() {
        let parsed = parse(json!({"type": "key", "text": "ctrl+c"})).unwrap();
        assert_eq!(
            parsed,
            Inbound::Command(CanonicalCommand::KeyCombination {
                keys: vec!["ctrl".into(), "c".into()],
            })
        );
    }

    #[test]
    fn scroll_direction_becomes_wheel_deltas() {
        let parsed = parse(json!({"type": "scroll", "direction": "up", "amount": 5})).unwrap();
        assert_eq!(
            parsed,
            Inbound::Command(CanonicalCommand::Scroll {
                dx: 0,
                dy: -5,
                at: None,
            })
        );
        assert!(matches!(
            parse(json!({"type": "scroll"})),
            Err(CommandError::MissingField { kind: "scroll", .. })
        ));
    }

    #[test]
    fn drag_reads_source_and_destination() {
        let parsed = parse(json!({
            "type": "drag",
            "source": {"x": 1, "y": 2},
            "destination": {"x": 3, "y": 4},
        }))
        .unwrap();
        assert_eq!(
            parsed,
            Inbound::Command(CanonicalCommand::Drag {
                source: Some(Target::model(1.0, 2.0)),
                destination: Target::model(3.0, 4.0),
                button: MouseButton::Left,
            })
        );
    }

    #[test]
    fn drag_keeps_each_end_in_its_own_space() {
        let drag = CanonicalCommand::Drag {
            source: Some(Target::model(500.0, 250.0)),
            destination: Target::logical(40.0, 80.0),
            button: MouseButton::Right,
        };
        let payload = drag.to_payload();
        assert_eq!(payload["space"], "logical");
        assert_eq!(payload["source_space"], "model");
        assert_eq!(parse(payload).unwrap(), Inbound::Command(drag));

        let same = CanonicalCommand::Drag {
            source: Some(Target::logical(1.0, 2.0)),
            destination: Target::logical(3.0, 4.0),
            button: MouseButton::Left,
        };
        assert!(same.to_payload().get("source_space").is_none());
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert_eq!(
            parse(json!({"type": "teleport"})),
            Err(CommandError::Unrecognized("teleport".into()))
        );
        assert!(matches!(
            parse(json!({"x": 1})),
            Err(CommandError::Malformed(_))
        ));
        assert!(matches!(
            parse(json!({"type": "navigate"})),
            Err(CommandError::MissingField { kind: "navigate", .. })
        ));
    }

    #[test]
    fn screenshot_responses_are_distinguished_from_commands() {
        let response = ScreenshotResponse {
            image: "aGVsbG8=".into(),
            request_id: Some("r-1".into()),
            metadata: Some(CaptureMetadata {
                original: Extent::new(2560, 1600),
                logical: Extent::new(1280, 800),
                scaled: Extent::new(1024, 640),
                scale_factor: 2.0,
                offset: Offset::default(),
            }),
        };
        let payload = response.to_payload();
        assert_eq!(payload["type"], SCREENSHOT_RESPONSE);
        assert_eq!(payload["metadata"]["logical"]["w"], 1280);
        assert_eq!(parse(payload).unwrap(), Inbound::ScreenshotResponse(response));
    }

    #[test]
    fn canonical_commands_survive_the_wire() {
        let commands = [
            CanonicalCommand::Click {
                button: MouseButton::Right,
                at: Some(Target::model(250.0, 750.0)),
            },
            CanonicalCommand::Scroll {
                dx: 0,
                dy: 3,
                at: None,
            },
            CanonicalCommand::OpenBrowser { url: None },
            CanonicalCommand::CaptureScreenshot {
                request_id: Some("abc".into()),
            },
        ];
        for command in commands {
            let parsed = parse(command.to_payload()).unwrap();
            assert_eq!(parsed, Inbound::Command(command));
        }
    }

    #[test]
    fn presence_role_is_read_from_member_meta() {
        let payload = PresencePayload::new(Role::Controller, Some("u-1".into()));
        let member = Member::new("m", payload.to_value());
        assert_eq!(Role::of(&member), Some(Role::Controller));
        assert_eq!(Role::of(&Member::new("m", json!({"type": "desktop"}))), None);
    }
}
