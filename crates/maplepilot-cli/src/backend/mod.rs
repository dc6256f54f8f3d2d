//! Input backends.
//!
//! The dispatcher only sees [`InputBackend`]. Whether keys are injected on
//! this machine or forwarded to a remote executor is decided once, when the
//! session connects.

pub mod local;
pub mod remote;

use std::time::Duration;

use async_trait::async_trait;
use maplepilot_core::error::{ApiError, ErrorCode};
use maplepilot_core::input::{CoordinateMode, InputRequest, KeyKind};
use maplepilot_core::settings::BackendKind;
use thiserror::Error;

pub use local::{KeyInjector, LocalBackend, TracingInjector};
pub use remote::RemoteBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("cannot reach input executor at {target}: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{0}")]
    Protocol(ApiError),

    #[error("executor rejected the request: {0}")]
    Rejected(ApiError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not connected to an input backend")]
    Disconnected,

    #[error("input backend I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the connection should be dropped and re-established.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            BackendError::Unreachable { .. }
                | BackendError::Timeout { .. }
                | BackendError::Protocol(_)
                | BackendError::Disconnected
                | BackendError::Io(_)
        )
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Protocol(api) | BackendError::Rejected(api) => api,
            BackendError::InvalidRequest(message) => ApiError::invalid_input(message),
            other => ApiError {
                code: ErrorCode::BackendUnreachable,
                message: other.to_string(),
                suggestion: Some(
                    "The connection will be retried automatically; check the executor if this persists"
                        .into(),
                ),
            },
        }
    }
}

/// Something that can press keys and move the mouse.
#[async_trait]
pub trait InputBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Mode mouse coordinates must be in when handed to [`send`](Self::send).
    fn coordinate_mode(&self) -> CoordinateMode;

    async fn send(&self, request: &InputRequest) -> Result<(), BackendError>;

    async fn key_state(&self, key: KeyKind) -> Result<bool, BackendError>;
}
