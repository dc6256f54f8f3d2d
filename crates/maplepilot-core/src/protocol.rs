//! Remote input protocol.
//!
//! Newline-delimited JSON over any byte stream. One request is in flight
//! per connection and every response echoes the request id.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::input::{CoordinateMode, InputRequest, InputTarget, KeyKind, MouseAction, Seed};

/// A request from the agent to an input executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Commands an input executor understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Once per connection. The executor answers with the coordinate mode
    /// it wants mouse coordinates in.
    Init { seed: Seed },
    KeyState { key: KeyKind },
    /// Press, hold for at least `down_ms`, release.
    Send { key: KeyKind, down_ms: u64 },
    KeyDown { key: KeyKind },
    KeyUp { key: KeyKind },
    Move { x: i32, y: i32 },
    Click { x: i32, y: i32 },
    ScrollDown { x: i32, y: i32 },
}

impl Command {
    /// Wire form of an input request. Mouse coordinates are taken as-is.
    pub fn from_input(request: &InputRequest) -> Command {
        match request.target {
            InputTarget::Key(key) => Command::Send {
                key: key.key,
                down_ms: key.down_ms,
            },
            InputTarget::KeyDown { key } => Command::KeyDown { key },
            InputTarget::KeyUp { key } => Command::KeyUp { key },
            InputTarget::Mouse(mouse) => {
                let (x, y) = (mouse.x, mouse.y);
                match mouse.action {
                    MouseAction::Move => Command::Move { x, y },
                    MouseAction::Click => Command::Click { x, y },
                    MouseAction::ScrollDown => Command::ScrollDown { x, y },
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Init { .. } => "init",
            Command::KeyState { .. } => "key_state",
            Command::Send { .. } => "send",
            Command::KeyDown { .. } => "key_down",
            Command::KeyUp { .. } => "key_up",
            Command::Move { .. } => "move",
            Command::Click { .. } => "click",
            Command::ScrollDown { .. } => "scroll_down",
        }
    }
}

/// A response from the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn ok(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::success(
            id,
            ResponseData::Ok {
                message: message.into(),
            },
        )
    }

    /// Check the id and unwrap the payload.
    ///
    /// An executor-side failure comes back as its own error; anything that
    /// does not fit the protocol is a protocol violation.
    pub fn into_result(self, expected_id: &str) -> Result<ResponseData, ApiError> {
        if self.id != expected_id {
            return Err(ApiError::protocol_violation(format!(
                "Response id '{}' does not match request id '{}'",
                self.id, expected_id
            )));
        }
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (true, None, _) => Err(ApiError::protocol_violation(
                "Successful response carries no data",
            )),
            (false, _, Some(error)) => Err(error),
            (false, _, None) => Err(ApiError::protocol_violation(
                "Failed response carries no error",
            )),
        }
    }
}

/// Response payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    Init { mouse_coordinate_mode: CoordinateMode },
    KeyState { pressed: bool },
    Ok { message: String },
}

impl ResponseData {
    pub fn into_coordinate_mode(self) -> Result<CoordinateMode, ApiError> {
        match self {
            ResponseData::Init {
                mouse_coordinate_mode,
            } => Ok(mouse_coordinate_mode),
            other => Err(unexpected("init", &other)),
        }
    }

    pub fn into_pressed(self) -> Result<bool, ApiError> {
        match self {
            ResponseData::KeyState { pressed } => Ok(pressed),
            other => Err(unexpected("key_state", &other)),
        }
    }

    pub fn into_ok(self) -> Result<(), ApiError> {
        match self {
            ResponseData::Ok { .. } => Ok(()),
            other => Err(unexpected("ok", &other)),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ResponseData::Init { .. } => "init",
            ResponseData::KeyState { .. } => "key_state",
            ResponseData::Ok { .. } => "ok",
        }
    }
}

fn unexpected(expected: &str, got: &ResponseData) -> ApiError {
    ApiError::protocol_violation(format!(
        "Expected '{}' response, got '{}'",
        expected,
        got.type_name()
    ))
}
