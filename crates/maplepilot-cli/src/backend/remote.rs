//! Client side of the remote input protocol.

use std::time::Duration;

use async_trait::async_trait;
use maplepilot_core::error::{ApiError, ErrorCode};
use maplepilot_core::input::{CoordinateMode, InputRequest, InputTarget, KeyKind, Seed};
use maplepilot_core::protocol::{Command, Request, Response, ResponseData};
use maplepilot_core::settings::BackendKind;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{BackendError, InputBackend};
use crate::wire::{read_line_bounded, write_line, MAX_LINE_SIZE};

/// Calls queued behind the one in flight.
const CALL_QUEUE: usize = 16;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

struct Call {
    request: Request,
    limit: Duration,
    reply: oneshot::Sender<Result<ResponseData, BackendError>>,
}

/// Talks to an input executor over TCP.
///
/// The connection is owned by a single I/O task that runs one exchange at
/// a time. A caller that goes away mid-call only drops its reply channel;
/// the task still reads the executor's answer, so the stream stays aligned
/// with our requests. After a timeout or a malformed response the stream
/// can no longer be trusted, so the task closes it and every further call
/// fails with [`BackendError::Disconnected`] until the session reconnects.
pub struct RemoteBackend {
    mode: CoordinateMode,
    request_timeout: Duration,
    calls: mpsc::Sender<Call>,
}

impl RemoteBackend {
    /// Connect and perform the init exchange.
    pub async fn connect(
        address: &str,
        seed: Seed,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let stream = timeout(request_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| BackendError::Timeout {
                operation: "connect",
                after: request_timeout,
            })?
            .map_err(|source| BackendError::Unreachable {
                target: address.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let (calls, queue) = mpsc::channel(CALL_QUEUE);
        tokio::spawn(run_connection(
            address.to_string(),
            Connection {
                reader: BufReader::new(reader),
                writer,
            },
            queue,
        ));

        let mut backend = Self {
            mode: CoordinateMode::default(),
            request_timeout,
            calls,
        };

        let mode = backend
            .call(Command::Init { seed }, request_timeout)
            .await?
            .into_coordinate_mode()
            .map_err(BackendError::Protocol)?;
        backend.mode = mode;
        debug!(
            "Connected to executor at {} (mouse coordinates: {:?})",
            address, backend.mode
        );
        Ok(backend)
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        !self.calls.is_closed()
    }

    async fn call(&self, command: Command, limit: Duration) -> Result<ResponseData, BackendError> {
        let (reply, answer) = oneshot::channel();
        let call = Call {
            request: Request {
                id: uuid::Uuid::new_v4().to_string(),
                command,
            },
            limit,
            reply,
        };
        self.calls
            .send(call)
            .await
            .map_err(|_| BackendError::Disconnected)?;
        answer.await.map_err(|_| BackendError::Disconnected)?
    }
}

/// Serve queued calls until the backend is dropped or the stream breaks.
async fn run_connection(address: String, mut conn: Connection, mut queue: mpsc::Receiver<Call>) {
    while let Some(call) = queue.recv().await {
        // Nobody is waiting for this one; do not press anything for it.
        if call.reply.is_closed() {
            debug!("Skipping abandoned {} request", call.request.command.name());
            continue;
        }

        let result = execute(&mut conn, &call.request, call.limit).await;
        let fatal = matches!(&result, Err(err) if err.is_connection_failure());
        if fatal {
            if let Err(err) = &result {
                warn!("Dropping connection to {}: {}", address, err);
            }
            // Close before answering so the caller already sees a dead backend.
            queue.close();
        }

        if call.reply.send(result).is_err() {
            debug!("Caller gone, discarded reply to {}", call.request.id);
        }
        if fatal {
            break;
        }
    }

    while let Some(call) = queue.recv().await {
        let _ = call.reply.send(Err(BackendError::Disconnected));
    }
    debug!("Connection to {} closed", address);
}

async fn execute(
    conn: &mut Connection,
    request: &Request,
    limit: Duration,
) -> Result<ResponseData, BackendError> {
    let response = match timeout(limit, exchange(conn, request)).await {
        Ok(response) => response?,
        Err(_) => {
            return Err(BackendError::Timeout {
                operation: request.command.name(),
                after: limit,
            })
        }
    };

    match response.into_result(&request.id) {
        Ok(data) => Ok(data),
        Err(err) if err.code == ErrorCode::ProtocolViolation => Err(BackendError::Protocol(err)),
        Err(err) => Err(BackendError::Rejected(err)),
    }
}

async fn exchange(conn: &mut Connection, request: &Request) -> Result<Response, BackendError> {
    write_line(&mut conn.writer, request).await?;

    let mut line = String::new();
    let n = read_line_bounded(&mut conn.reader, &mut line, MAX_LINE_SIZE).await?;
    if n == 0 {
        return Err(BackendError::Disconnected);
    }

    serde_json::from_str(line.trim_end()).map_err(|e| {
        BackendError::Protocol(ApiError::protocol_violation(format!(
            "Unparseable response: {}",
            e
        )))
    })
}

#[async_trait]
impl InputBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn coordinate_mode(&self) -> CoordinateMode {
        self.mode
    }

    async fn send(&self, request: &InputRequest) -> Result<(), BackendError> {
        // The executor holds the key itself, so allow for that on top.
        let limit = match request.target {
            InputTarget::Key(key) => self.request_timeout + Duration::from_millis(key.down_ms),
            _ => self.request_timeout,
        };
        self.call(Command::from_input(request), limit)
            .await?
            .into_ok()
            .map_err(BackendError::Protocol)
    }

    async fn key_state(&self, key: KeyKind) -> Result<bool, BackendError> {
        self.call(Command::KeyState { key }, self.request_timeout)
            .await?
            .into_pressed()
            .map_err(BackendError::Protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one connection, answering each request with `respond`.
    async fn fake_executor<F>(respond: F) -> String
    where
        F: Fn(Request) -> Option<String> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Request = serde_json::from_str(&line).unwrap();
                if let Some(reply) = respond(request) {
                    writer.write_all(reply.as_bytes()).await.unwrap();
                    writer.write_all(b"\n").await.unwrap();
                }
            }
        });
        address
    }

    fn init_reply(id: &str) -> String {
        serde_json::to_string(&Response::success(
            id,
            ResponseData::Init {
                mouse_coordinate_mode: CoordinateMode::Relative,
            },
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_mismatched_id_poisons_connection() {
        let address = fake_executor(|request| match request.command {
            Command::Init { .. } => Some(init_reply(&request.id)),
            _ => Some(serde_json::to_string(&Response::ok("someone-else", "sent")).unwrap()),
        })
        .await;

        let backend = RemoteBackend::connect(&address, Seed([1; 32]), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(backend.coordinate_mode(), CoordinateMode::Relative);

        let err = backend
            .send(&InputRequest::key(KeyKind::A, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
        assert!(!backend.is_connected());

        let err = backend.key_state(KeyKind::A).await.unwrap_err();
        assert!(matches!(err, BackendError::Disconnected));
    }

    #[tokio::test]
    async fn test_silent_executor_times_out() {
        let address = fake_executor(|request| match request.command {
            Command::Init { .. } => Some(init_reply(&request.id)),
            _ => None,
        })
        .await;

        let backend = RemoteBackend::connect(&address, Seed([2; 32]), Duration::from_millis(100))
            .await
            .unwrap();

        let err = backend.key_state(KeyKind::Space).await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::Timeout {
                operation: "key_state",
                ..
            }
        ));
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_garbage_response_is_protocol_violation() {
        let address = fake_executor(|request| match request.command {
            Command::Init { .. } => Some(init_reply(&request.id)),
            _ => Some("not json".to_string()),
        })
        .await;

        let backend = RemoteBackend::connect(&address, Seed([3; 32]), Duration::from_secs(2))
            .await
            .unwrap();

        let err = backend.key_state(KeyKind::Space).await.unwrap_err();
        match err {
            BackendError::Protocol(api) => assert_eq!(api.code, ErrorCode::ProtocolViolation),
            other => panic!("expected protocol violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RemoteBackend::connect(&address, Seed([4; 32]), Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BackendError::Unreachable { .. }));
    }
}
