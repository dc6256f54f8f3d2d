//! Same-machine input backend.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use maplepilot_core::input::{CoordinateMode, InputRequest, InputTarget, KeyKind, MouseAction};
use maplepilot_core::settings::BackendKind;
use tracing::{debug, trace};

use super::{BackendError, InputBackend};

/// The OS-level key and mouse injection.
///
/// Implementations must not block for long; hold times are handled by
/// the caller.
pub trait KeyInjector: Send + Sync {
    fn key_down(&self, key: KeyKind) -> io::Result<()>;
    fn key_up(&self, key: KeyKind) -> io::Result<()>;
    /// `x`/`y` are screen coordinates.
    fn mouse(&self, action: MouseAction, x: i32, y: i32) -> io::Result<()>;
    fn is_pressed(&self, key: KeyKind) -> bool;
}

/// Injector that only logs and remembers which keys are down.
#[derive(Debug, Default)]
pub struct TracingInjector {
    pressed: Mutex<HashSet<KeyKind>>,
}

impl TracingInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn pressed(&self) -> std::sync::MutexGuard<'_, HashSet<KeyKind>> {
        self.pressed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyInjector for TracingInjector {
    fn key_down(&self, key: KeyKind) -> io::Result<()> {
        debug!("key down: {}", key);
        self.pressed().insert(key);
        Ok(())
    }

    fn key_up(&self, key: KeyKind) -> io::Result<()> {
        debug!("key up: {}", key);
        self.pressed().remove(&key);
        Ok(())
    }

    fn mouse(&self, action: MouseAction, x: i32, y: i32) -> io::Result<()> {
        debug!("mouse {:?} at ({}, {})", action, x, y);
        Ok(())
    }

    fn is_pressed(&self, key: KeyKind) -> bool {
        self.pressed().contains(&key)
    }
}

/// Injects input directly on this machine. Expects screen coordinates.
pub struct LocalBackend {
    injector: Arc<dyn KeyInjector>,
}

impl LocalBackend {
    pub fn new(injector: Arc<dyn KeyInjector>) -> Self {
        Self { injector }
    }
}

#[async_trait]
impl InputBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn coordinate_mode(&self) -> CoordinateMode {
        CoordinateMode::Screen
    }

    async fn send(&self, request: &InputRequest) -> Result<(), BackendError> {
        trace!("local send: {:?}", request.target);
        match request.target {
            InputTarget::Key(key) => {
                self.injector.key_down(key.key)?;
                tokio::time::sleep(Duration::from_millis(key.down_ms)).await;
                self.injector.key_up(key.key)?;
            }
            InputTarget::KeyDown { key } => self.injector.key_down(key)?,
            InputTarget::KeyUp { key } => self.injector.key_up(key)?,
            InputTarget::Mouse(mouse) => {
                if mouse.coordinate_mode != CoordinateMode::Screen {
                    return Err(BackendError::InvalidRequest(
                        "local backend needs screen coordinates".into(),
                    ));
                }
                self.injector.mouse(mouse.action, mouse.x, mouse.y)?;
            }
        }
        Ok(())
    }

    async fn key_state(&self, key: KeyKind) -> Result<bool, BackendError> {
        Ok(self.injector.is_pressed(key))
    }
}
