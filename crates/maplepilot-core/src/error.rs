//! Operator-facing error types with suggestions.
//!
//! Every condition the core cannot absorb on its own ends up as an
//! [`ApiError`]: it travels over the remote input protocol, lands in the
//! status report shown by the UI, and is logged by the agent loop.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes shared by the protocol and the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Minimap not cleanly cropped or overlapped. Recoverable.
    PerceptionUncertain,
    /// An action was deferred more often than the configured cap.
    ActionContention,
    /// Recovery retries exhausted; the operator has to look at the game.
    StuckCondition,
    /// The input backend could not be reached.
    BackendUnreachable,
    /// Malformed or mismatched remote response.
    ProtocolViolation,
    InvalidInput,
    InternalError,
}

impl ErrorCode {
    /// Whether this code means the bot cannot continue without a human.
    pub fn needs_attention(&self) -> bool {
        matches!(self, ErrorCode::StuckCondition | ErrorCode::BackendUnreachable)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::PerceptionUncertain => write!(f, "PERCEPTION_UNCERTAIN"),
            ErrorCode::ActionContention => write!(f, "ACTION_CONTENTION"),
            ErrorCode::StuckCondition => write!(f, "STUCK_CONDITION"),
            ErrorCode::BackendUnreachable => write!(f, "BACKEND_UNREACHABLE"),
            ErrorCode::ProtocolViolation => write!(f, "PROTOCOL_VIOLATION"),
            ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// An error with context for whoever is watching the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn perception_uncertain(detail: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::PerceptionUncertain,
            message: detail.into(),
            suggestion: Some(
                "Make sure the minimap is fully visible and not covered by other windows, then trigger a re-detect"
                    .into(),
            ),
        }
    }

    /// An action kept losing the input backend to other actions.
    pub fn action_contention(label: &str, deferrals: u32, cap: u32) -> Self {
        Self {
            code: ErrorCode::ActionContention,
            message: format!(
                "Action '{}' was deferred {} times (cap {}), it will run at the next free slot",
                label, deferrals, cap
            ),
            suggestion: Some(
                "Lengthen the interval of recurring actions or shorten their waits".into(),
            ),
        }
    }

    /// Recovery gave up after `retries` attempts.
    pub fn stuck(retries: u32) -> Self {
        Self {
            code: ErrorCode::StuckCondition,
            message: format!(
                "Player is still stuck after {} recovery attempts",
                retries
            ),
            suggestion: Some(
                "Check the game window for dialogs or a map change and move the character manually"
                    .into(),
            ),
        }
    }

    pub fn backend_unreachable(target: &str, attempts: u32, error: &str) -> Self {
        Self {
            code: ErrorCode::BackendUnreachable,
            message: format!(
                "Input backend '{}' unreachable after {} attempt(s): {}",
                target, attempts, error
            ),
            suggestion: Some(
                "Verify the remote executor is running ('maplepilot executor') and the address is correct"
                    .into(),
            ),
        }
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ProtocolViolation,
            message: message.into(),
            suggestion: Some(
                "Make sure both sides run the same maplepilot protocol version".into(),
            ),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some("Check the request fields and try again".into()),
        }
    }

    /// Create an invalid input error with a custom suggestion.
    pub fn invalid_input_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn unknown_key(name: &str) -> Self {
        Self::invalid_input_with_suggestion(
            format!("Unknown key '{}'", name),
            "Use names like a, f1, space, esc, left, page_up",
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
            suggestion: Some("This is an internal error. Please report it if it persists.".into()),
        }
    }
}
