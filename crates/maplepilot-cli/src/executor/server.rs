//! TCP server for the remote input executor.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use maplepilot_core::error::ApiError;
use maplepilot_core::input::{
    CoordinateMode, KeyKind, KeyTiming, KeyTimingConfig, MouseAction, MouseRequest, WindowRect,
};
use maplepilot_core::protocol::{Command, Request, Response, ResponseData};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::KeyInjector;
use crate::wire::{read_line_bounded, write_line, MAX_LINE_SIZE};

/// One agent drives one executor; a few spare slots cover reconnects
/// racing the old connection's teardown.
const MAX_CONNECTIONS: usize = 4;

/// How long to wait for in-flight connections to complete during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest key hold the executor accepts.
pub const MAX_DOWN_MS: u64 = 10_000;

/// How the executor injects input and which coordinates it wants.
pub struct ExecutorConfig {
    pub injector: Arc<dyn KeyInjector>,
    pub coordinate_mode: CoordinateMode,
    /// Game window on this machine, for `Relative` coordinates.
    pub window: WindowRect,
    pub timing: KeyTimingConfig,
}

pub struct ExecutorServer {
    listener: TcpListener,
    config: Arc<ExecutorConfig>,
    /// Semaphore to limit concurrent connections.
    connection_semaphore: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl ExecutorServer {
    pub async fn bind(address: &str, config: ExecutorConfig) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind executor to {}", address))?;
        info!(
            "Executor listening on {} ({:?} mouse coordinates)",
            listener.local_addr()?,
            config.coordinate_mode
        );

        Ok(Self {
            listener,
            config: Arc::new(config),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Handle for stopping [`run`](Self::run) from elsewhere.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown.
    ///
    /// On shutdown, waits for in-flight connections to complete (with timeout).
    pub async fn run(&self) -> Result<()> {
        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting {}",
                                        MAX_CONNECTIONS, peer
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            info!("Agent connected from {}", peer);
                            let config = self.config.clone();
                            connection_tasks.spawn(async move {
                                // Permit is held for the lifetime of the connection handler
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, config).await {
                                    error!("Connection from {} failed: {:#}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received, waiting for in-flight connections");
                    break;
                }
            }
        }

        if !connection_tasks.is_empty() {
            let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "Graceful shutdown timed out after {:?}, aborting {} connection(s)",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    connection_tasks.len()
                );
                connection_tasks.abort_all();
            }
        }

        Ok(())
    }
}

/// Per-connection state.
#[derive(Default)]
struct Connection {
    /// Set by `init`; nothing else is served before it.
    timing: Option<KeyTiming>,
    /// Keys pressed with `key_down` and not yet released.
    held: HashSet<KeyKind>,
}

async fn handle_connection(stream: TcpStream, config: Arc<ExecutorConfig>) -> Result<()> {
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut conn = Connection::default();

    let result = serve(&mut reader, &mut writer, &mut conn, &config).await;
    release_held(&mut conn, &config);
    result
}

async fn serve(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    conn: &mut Connection,
    config: &ExecutorConfig,
) -> Result<()> {
    let mut line = String::new();

    loop {
        line.clear();

        let bytes_read = read_line_bounded(reader, &mut line, MAX_LINE_SIZE)
            .await
            .context("Failed to read request")?;
        if bytes_read == 0 {
            debug!("Agent disconnected");
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => handle_request(request, conn, config).await,
            Err(e) => Response::error(
                "unknown",
                ApiError::invalid_input_with_suggestion(
                    format!("Invalid JSON request: {}", e),
                    "Ensure the request is valid JSON with 'id' and 'command' fields. Example: {\"id\":\"1\",\"command\":{\"action\":\"key_state\",\"key\":\"space\"}}",
                ),
            ),
        };

        write_line(writer, &response)
            .await
            .context("Failed to write response")?;
    }
}

/// Lift keys a vanished agent left pressed.
fn release_held(conn: &mut Connection, config: &ExecutorConfig) {
    for key in conn.held.drain() {
        debug!("Releasing {} left down by the agent", key);
        if let Err(e) = config.injector.key_up(key) {
            warn!("Failed to release {}: {}", key, e);
        }
    }
}

async fn handle_request(
    request: Request,
    conn: &mut Connection,
    config: &ExecutorConfig,
) -> Response {
    debug!("Handling command: {}", request.command.name());
    let id = request.id;
    let initialized = conn.timing.is_some();

    let result = match request.command {
        Command::Init { seed } => {
            conn.timing = Some(KeyTiming::from_seed(seed, config.timing));
            info!("Agent initialized with seed {:?}", seed);
            return Response::success(
                id,
                ResponseData::Init {
                    mouse_coordinate_mode: config.coordinate_mode,
                },
            );
        }
        _ if !initialized => {
            return Response::error(
                id,
                ApiError::invalid_input_with_suggestion(
                    "Connection is not initialized",
                    "Send an 'init' command with the agent seed first",
                ),
            );
        }
        Command::KeyState { key } => {
            let pressed = config.injector.is_pressed(key);
            return Response::success(id, ResponseData::KeyState { pressed });
        }
        Command::Send { key, down_ms } => {
            if down_ms > MAX_DOWN_MS {
                return Response::error(
                    id,
                    ApiError::invalid_input_with_suggestion(
                        format!("down_ms {} exceeds maximum of {}", down_ms, MAX_DOWN_MS),
                        format!("Use a hold time of at most {} ms", MAX_DOWN_MS),
                    ),
                );
            }
            // 0 means "pick one"; the seeded timing reproduces the agent's jitter.
            let down_ms = match (down_ms, conn.timing.as_mut()) {
                (0, Some(timing)) => timing.next_down_ms(),
                (0, None) => config.timing.down_min_ms,
                (ms, _) => ms,
            };
            press(config, key, down_ms).await
        }
        Command::KeyDown { key } => config.injector.key_down(key).map(|()| {
            conn.held.insert(key);
        }),
        Command::KeyUp { key } => config.injector.key_up(key).map(|()| {
            conn.held.remove(&key);
        }),
        Command::Move { x, y } => mouse(config, MouseAction::Move, x, y),
        Command::Click { x, y } => mouse(config, MouseAction::Click, x, y),
        Command::ScrollDown { x, y } => mouse(config, MouseAction::ScrollDown, x, y),
    };

    match result {
        Ok(()) => Response::ok(id, "done"),
        Err(e) => Response::error(
            id,
            ApiError::internal(format!("Input injection failed: {}", e)),
        ),
    }
}

async fn press(config: &ExecutorConfig, key: KeyKind, down_ms: u64) -> std::io::Result<()> {
    config.injector.key_down(key)?;
    tokio::time::sleep(Duration::from_millis(down_ms)).await;
    config.injector.key_up(key)
}

/// Coordinates arrive in the mode we announced at init.
fn mouse(config: &ExecutorConfig, action: MouseAction, x: i32, y: i32) -> std::io::Result<()> {
    let request = MouseRequest {
        action,
        x,
        y,
        coordinate_mode: config.coordinate_mode,
    }
    .convert(CoordinateMode::Screen, config.window);
    config.injector.mouse(action, request.x, request.y)
}
