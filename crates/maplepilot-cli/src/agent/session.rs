//! Process-wide session: seed, window geometry and the active backend.

use std::sync::Arc;
use std::time::Duration;

use maplepilot_core::error::ApiError;
use maplepilot_core::input::{CoordinateMode, Seed, WindowRect};
use maplepilot_core::settings::{BackendKind, BackendSettings, Settings};
use serde::Serialize;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, InputBackend, KeyInjector, LocalBackend, RemoteBackend};

/// Connection state as shown to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting {
        attempt: u32,
    },
    Connected {
        kind: BackendKind,
        coordinate_mode: CoordinateMode,
    },
    Unreachable {
        error: ApiError,
    },
}

/// Shared by the control loop, the dispatcher and the connection manager.
///
/// The backend slot is written only by the connection manager task;
/// everyone else reads it and reports failures through
/// [`report_failure`](Self::report_failure).
pub struct Session {
    seed: Seed,
    window: WindowRect,
    backend_settings: BackendSettings,
    request_timeout: Duration,
    injector: Arc<dyn KeyInjector>,
    backend: RwLock<Option<Arc<dyn InputBackend>>>,
    reconnect: Notify,
    state: watch::Sender<ConnectionState>,
}

impl Session {
    pub fn new(settings: &Settings, seed: Seed, injector: Arc<dyn KeyInjector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting { attempt: 0 });
        Self {
            seed,
            window: settings.window,
            backend_settings: settings.backend.clone(),
            request_timeout: settings.timeouts.remote_request(),
            injector,
            backend: RwLock::new(None),
            reconnect: Notify::new(),
            state,
        }
    }

    pub fn seed(&self) -> Seed {
        self.seed
    }

    pub fn window(&self) -> WindowRect {
        self.window
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend_settings.kind
    }

    /// The active backend, if connected.
    pub async fn backend(&self) -> Option<Arc<dyn InputBackend>> {
        self.backend.read().await.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Tell the connection manager a call on `backend` failed.
    ///
    /// Only connection-level failures on the installed backend trigger a
    /// reconnect. A rejected request leaves the connection alone, and a
    /// late report about a backend that was already replaced is dropped.
    pub async fn report_failure(&self, backend: &Arc<dyn InputBackend>, err: &BackendError) {
        if !err.is_connection_failure() {
            return;
        }
        // Notify under the read guard so the manager cannot clear the slot
        // in between and then pick up a permit meant for the old backend.
        let slot = self.backend.read().await;
        if slot.as_ref().is_some_and(|current| same_backend(current, backend)) {
            debug!("Backend failure reported: {}", err);
            self.reconnect.notify_one();
        } else {
            debug!("Ignoring failure from a replaced backend: {}", err);
        }
    }

    /// Connect to the configured backend, retrying with backoff.
    ///
    /// Does not install the backend; the connection manager does that.
    pub async fn connect(&self) -> Result<Arc<dyn InputBackend>, ApiError> {
        if self.backend_settings.kind == BackendKind::Local {
            return Ok(Arc::new(LocalBackend::new(self.injector.clone())));
        }

        let address = &self.backend_settings.address;
        let attempts = self.backend_settings.connect_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backend_settings.backoff(attempt - 1);
                debug!("Retrying {} in {:?}", address, delay);
                tokio::time::sleep(delay).await;
            }
            self.state
                .send_replace(ConnectionState::Connecting { attempt: attempt + 1 });

            match RemoteBackend::connect(address, self.seed, self.request_timeout).await {
                Ok(backend) => return Ok(Arc::new(backend)),
                Err(e) => {
                    warn!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        attempts,
                        address,
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(ApiError::backend_unreachable(address, attempts, &last_error))
    }

    /// Keep a backend installed until `shutdown` fires.
    ///
    /// After a failed round of attempts the manager waits for the next
    /// reported failure (or an explicit [`request_reconnect`](Self::request_reconnect))
    /// before trying again.
    pub fn spawn_connection_manager(self: &Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let connected = tokio::select! {
                    result = session.connect() => result,
                    _ = shutdown.notified() => break,
                };

                match connected {
                    Ok(backend) => {
                        info!(
                            "Input backend ready: {} ({:?} mouse coordinates)",
                            backend.kind(),
                            backend.coordinate_mode()
                        );
                        let state = ConnectionState::Connected {
                            kind: backend.kind(),
                            coordinate_mode: backend.coordinate_mode(),
                        };
                        *session.backend.write().await = Some(backend);
                        session.state.send_replace(state);
                    }
                    Err(error) => {
                        warn!("{}", error);
                        session
                            .state
                            .send_replace(ConnectionState::Unreachable { error });
                    }
                }

                tokio::select! {
                    _ = session.reconnect.notified() => {}
                    _ = shutdown.notified() => break,
                }
                session
                    .state
                    .send_replace(ConnectionState::Connecting { attempt: 0 });
                *session.backend.write().await = None;
                // Later reports about the old backend stored a permit too.
                tokio::select! {
                    biased;
                    _ = session.reconnect.notified() => {}
                    _ = std::future::ready(()) => {}
                }
                info!("Reconnecting input backend");
            }
            debug!("Connection manager stopped");
        })
    }

    /// Ask for a fresh connection. Ignored while a connect round is running.
    pub fn request_reconnect(&self) {
        if matches!(*self.state.borrow(), ConnectionState::Connecting { .. }) {
            debug!("Already connecting, reconnect request ignored");
            return;
        }
        self.reconnect.notify_one();
    }
}

fn same_backend(a: &Arc<dyn InputBackend>, b: &Arc<dyn InputBackend>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
