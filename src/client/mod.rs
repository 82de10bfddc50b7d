//! Queue client library.
//!
//! One long-lived connection to the daemon. Correlated requests
//! (`enqueue`/`cancel`/`status`/`shutdown`) are matched to their response by
//! a random `request_id` and a pending-oneshot map, the same shape the
//! subprocess RPC harness uses for its own request/response correlation —
//! kept consistent across both IPC boundaries. Pushed messages (`play_now`,
//! `abort`) have no `request_id` and are delivered through one-shot waiters
//! / a registered callback instead.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::config::VqdConfig;
use crate::daemon;
use crate::error::ProtocolError;
use crate::ipc::protocol::{write_line, ClientMessage, DaemonHealth, DaemonMessage};
use crate::queue::{EnqueueRequest, QueueItem, QueueStats};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type AbortHandler = Box<dyn Fn(String, String) + Send + Sync>;

struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<DaemonMessage>>>,
    play_waiter: Mutex<Option<oneshot::Sender<QueueItem>>>,
    on_abort: Mutex<Option<AbortHandler>>,
}

pub struct QueueClient {
    writer: tokio::sync::Mutex<tokio::net::unix::OwnedWriteHalf>,
    shared: Arc<Shared>,
    reader_handle: JoinHandle<()>,
    request_timeout: Duration,
}

impl QueueClient {
    /// Connect to the daemon, starting it first if it isn't already
    /// running.
    pub async fn connect(config: &VqdConfig, vqd_binary: &Path) -> Result<Self, ProtocolError> {
        if !daemon::is_daemon_running(config) {
            daemon::start_daemon(
                vqd_binary,
                None,
                &config.socket_path,
                config.daemon_start_timeout(),
            )
            .await
            .map_err(|_| ProtocolError::DaemonStartTimeout(config.daemon_start_timeout()))?;
        }

        let stream = connect_with_retry(&config.socket_path, config.connect_timeout()).await?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: UnixStream) -> Result<Self, ProtocolError> {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            play_waiter: Mutex::new(None),
            on_abort: Mutex::new(None),
        });

        let reader_shared = shared.clone();
        let reader_handle = tokio::spawn(read_loop(read_half, reader_shared));

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            reader_handle,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Register a handler invoked when the daemon pushes `abort` for the
    /// item currently playing on this connection.
    pub fn on_abort<F>(&self, handler: F)
    where
        F: Fn(String, String) + Send + Sync + 'static,
    {
        *self.shared.on_abort.lock().unwrap() = Some(Box::new(handler));
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<(String, usize), ProtocolError> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::Enqueue {
            payload: request,
            request_id: Some(request_id.clone()),
        };
        match self.send_request(msg, request_id).await? {
            DaemonMessage::Queued { id, position, .. } => Ok((id, position)),
            DaemonMessage::Error { message, .. } => Err(ProtocolError::UnknownType(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self, id: &str) -> Result<(), ProtocolError> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::Cancel {
            id: id.to_string(),
            request_id: Some(request_id.clone()),
        };
        match self.send_request(msg, request_id).await? {
            DaemonMessage::Cancelled { .. } => Ok(()),
            DaemonMessage::Error { message, .. } => Err(ProtocolError::UnknownType(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_status(&self) -> Result<(QueueStats, DaemonHealth), ProtocolError> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::Status { request_id: Some(request_id.clone()) };
        match self.send_request(msg, request_id).await? {
            DaemonMessage::Status { stats, health, .. } => Ok((stats, health)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn request_shutdown(&self) -> Result<(), ProtocolError> {
        let request_id = Uuid::new_v4().to_string();
        let msg = ClientMessage::Shutdown { request_id: Some(request_id.clone()) };
        match self.send_request(msg, request_id).await? {
            DaemonMessage::ShutdownAck { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Block until the daemon signals `play_now` for an item enqueued on
    /// this connection, or `timeout` elapses.
    pub async fn wait_for_play_signal(&self, timeout: Duration) -> Result<QueueItem, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        *self.shared.play_waiter.lock().unwrap() = Some(tx);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(item)) => Ok(item),
            Ok(Err(_)) => Err(ProtocolError::NotConnected),
            Err(_) => {
                *self.shared.play_waiter.lock().unwrap() = None;
                Err(ProtocolError::Timeout(timeout))
            }
        }
    }

    pub async fn report_complete(&self, id: &str, duration_ms: u64) -> Result<(), ProtocolError> {
        self.send_notification(ClientMessage::PlaybackComplete {
            id: id.to_string(),
            duration_ms,
        })
        .await
    }

    pub async fn report_failed(&self, id: &str, error: &str) -> Result<(), ProtocolError> {
        self.send_notification(ClientMessage::PlaybackFailed {
            id: id.to_string(),
            error: error.to_string(),
        })
        .await
    }

    pub async fn report_interrupted(&self, id: &str) -> Result<(), ProtocolError> {
        self.send_notification(ClientMessage::PlaybackInterrupted { id: id.to_string() })
            .await
    }

    /// Convenience wrapper for the common one-utterance flow: enqueue, wait
    /// for the play signal, hand the item back to the caller to actually
    /// speak (playback drivers are out of scope here).
    pub async fn enqueue_and_wait(
        &self,
        request: EnqueueRequest,
        play_timeout: Duration,
    ) -> Result<QueueItem, ProtocolError> {
        self.enqueue(request).await?;
        self.wait_for_play_signal(play_timeout).await
    }

    async fn send_request(
        &self,
        msg: ClientMessage,
        request_id: String,
    ) -> Result<DaemonMessage, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(request_id.clone(), tx);

        if let Err(e) = self.write(&msg).await {
            self.shared.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ProtocolError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&request_id);
                Err(ProtocolError::Timeout(self.request_timeout))
            }
        }
    }

    async fn send_notification(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        self.write(&msg).await
    }

    async fn write(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let mut guard = self.writer.lock().await;
        write_line(&mut *guard, msg).await?;
        Ok(())
    }

    pub async fn disconnect(self) {
        self.reader_handle.abort();
    }
}

fn unexpected(msg: DaemonMessage) -> ProtocolError {
    ProtocolError::UnknownType(format!("unexpected response: {msg:?}"))
}

const RETRY_BACKOFF_CAP: Duration = Duration::from_millis(500);

/// Retry the initial connect with capped exponential backoff — the
/// daemon may still be finishing its bind when a freshly auto-started
/// process races us here.
async fn connect_with_retry(
    socket_path: &Path,
    timeout: Duration,
) -> Result<UnixStream, ProtocolError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut backoff = Duration::from_millis(25);
    loop {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(ProtocolError::Io(e));
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
            }
        }
    }
}

async fn read_loop(read_half: tokio::net::unix::OwnedReadHalf, shared: Arc<Shared>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<DaemonMessage>(&line) {
                    Ok(msg) => dispatch(&shared, msg),
                    Err(e) => warn!(error = %e, "malformed daemon message"),
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

fn dispatch(shared: &Arc<Shared>, msg: DaemonMessage) {
    match msg {
        DaemonMessage::PlayNow { item, .. } => {
            if let Some(tx) = shared.play_waiter.lock().unwrap().take() {
                let _ = tx.send(item);
            }
        }
        DaemonMessage::Abort { id, reason } => {
            if let Some(handler) = shared.on_abort.lock().unwrap().as_ref() {
                handler(id, reason);
            }
        }
        DaemonMessage::Queued { ref request_id, .. }
        | DaemonMessage::Cancelled { ref request_id, .. }
        | DaemonMessage::Status { ref request_id, .. }
        | DaemonMessage::Error { ref request_id, .. }
        | DaemonMessage::ShutdownAck { ref request_id } => {
            let Some(id) = request_id else {
                warn!("correlated response missing request_id");
                return;
            };
            if let Some(tx) = shared.pending.lock().unwrap().remove(id) {
                let _ = tx.send(msg);
            }
        }
    }
}
