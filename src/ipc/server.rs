//! IPC server.
//!
//! Single cooperative event loop: the listener, per-connection readers, and
//! queue events all feed one `tokio::select!` so queue mutations never need
//! a lock. Per-connection read/write tasks are split in two — a reader task
//! forwards parsed messages into the central loop over an mpsc channel, a
//! writer task drains an outgoing mpsc channel onto the socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use super::protocol::{write_line, ClientMessage, DaemonHealth, DaemonMessage};
use crate::config::VqdConfig;
use crate::queue::{DropReason, PriorityQueue, QueueEvent, QueueItem};

type ConnId = u64;

struct ConnHandle {
    tx: mpsc::UnboundedSender<DaemonMessage>,
    current_item_id: Option<String>,
}

enum Inbound {
    Message(ConnId, ClientMessage),
    Malformed(ConnId, Option<String>),
    Disconnected(ConnId),
}

/// Armed speaker-transition timer: fires `play_now` for `item` on `conn`.
struct PendingTransition {
    conn: ConnId,
    item: QueueItem,
    sleep: Pin<Box<Sleep>>,
}

pub struct Server {
    queue: PriorityQueue,
    queue_events: tokio::sync::broadcast::Receiver<QueueEvent>,
    connections: HashMap<ConnId, ConnHandle>,
    order: Vec<ConnId>,
    playing_connection: Option<ConnId>,
    config: VqdConfig,
    next_conn_id: AtomicU64,
    pending_transition: Option<PendingTransition>,
    started_at: std::time::Instant,
    shutdown_requested: bool,
}

impl Server {
    pub fn new(config: VqdConfig) -> Self {
        let (queue, queue_events) = PriorityQueue::new(
            config.max_queue_size,
            config.interrupt_threshold,
            config.interruption_policy,
        );
        Self {
            queue,
            queue_events,
            connections: HashMap::new(),
            order: Vec::new(),
            playing_connection: None,
            config,
            next_conn_id: AtomicU64::new(1),
            pending_transition: None,
            started_at: std::time::Instant::now(),
            shutdown_requested: false,
        }
    }

    /// Bind the listener, unlinking any stale socket file first.
    pub async fn bind(path: &Path) -> std::io::Result<UnixListener> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        UnixListener::bind(path)
    }

    /// Run the server loop until `shutdown_rx` fires.
    pub async fn run(
        mut self,
        listener: UnixListener,
        socket_path: PathBuf,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Inbound>();

        loop {
            let transition_armed = self.pending_transition.is_some();
            tokio::select! {
                accepted = listener.accept() => {
                    if let Ok((stream, _addr)) = accepted {
                        self.accept_connection(stream, inbound_tx.clone());
                    }
                }
                Some(inbound) = inbound_rx.recv() => {
                    self.handle_inbound(inbound).await;
                    if self.shutdown_requested {
                        info!("client requested shutdown, draining connections");
                        break;
                    }
                }
                _ = async {
                    if let Some(p) = self.pending_transition.as_mut() {
                        (&mut p.sleep).await;
                    }
                }, if transition_armed => {
                    self.fire_speaker_transition();
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown requested, draining connections");
                    break;
                }
            }
        }

        for (_, handle) in self.connections.iter() {
            let _ = handle.tx.send(DaemonMessage::ShutdownAck { request_id: None });
        }
        let _ = std::fs::remove_file(&socket_path);
    }

    fn accept_connection(&mut self, stream: UnixStream, inbound_tx: mpsc::UnboundedSender<Inbound>) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<DaemonMessage>();

        self.connections.insert(
            id,
            ConnHandle {
                tx: out_tx.clone(),
                current_item_id: None,
            },
        );
        self.order.push(id);

        tokio::spawn(read_loop(id, read_half, inbound_tx));
        tokio::spawn(write_loop(write_half, out_rx));

        debug!(conn = id, "client connected");
        self.process_queue();
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(conn, msg) => self.handle_message(conn, msg),
            Inbound::Malformed(conn, request_id) => {
                if let Some(handle) = self.connections.get(&conn) {
                    let _ = handle.tx.send(DaemonMessage::Error {
                        message: "malformed JSON line".into(),
                        request_id,
                    });
                }
            }
            Inbound::Disconnected(conn) => self.handle_disconnect(conn),
        }
    }

    fn handle_message(&mut self, conn: ConnId, msg: ClientMessage) {
        match msg {
            ClientMessage::Enqueue { payload, request_id } => {
                let (id, position) = self.queue.enqueue(payload);
                self.drain_queue_events();
                self.respond(conn, DaemonMessage::Queued { id, position, request_id });
                self.process_queue();
            }
            ClientMessage::Cancel { id, request_id } => {
                if self.queue.cancel(&id) {
                    self.respond(conn, DaemonMessage::Cancelled { id, request_id });
                } else {
                    self.respond(
                        conn,
                        DaemonMessage::Error {
                            message: format!("unknown item id: {id}"),
                            request_id,
                        },
                    );
                }
            }
            ClientMessage::Status { request_id } => {
                let stats = self.queue.get_stats();
                let health = DaemonHealth {
                    pid: std::process::id(),
                    uptime_secs: self.started_at.elapsed().as_secs(),
                };
                self.respond(conn, DaemonMessage::Status { stats, health, request_id });
            }
            ClientMessage::Shutdown { request_id } => {
                self.respond(conn, DaemonMessage::ShutdownAck { request_id });
                self.shutdown_requested = true;
            }
            ClientMessage::PlaybackComplete { id, duration_ms } => {
                self.queue.mark_completed(&id, duration_ms);
                self.release_playing(conn, &id);
                self.process_queue();
            }
            ClientMessage::PlaybackFailed { id, error } => {
                self.queue.mark_failed(&id, &error);
                self.release_playing(conn, &id);
                self.process_queue();
            }
            ClientMessage::PlaybackInterrupted { id } => {
                self.queue.handle_interruption(&id);
                self.drain_queue_events();
                self.release_playing(conn, &id);
                self.process_queue();
            }
        }
    }

    fn respond(&self, conn: ConnId, msg: DaemonMessage) {
        if let Some(handle) = self.connections.get(&conn) {
            let _ = handle.tx.send(msg);
        }
    }

    fn release_playing(&mut self, conn: ConnId, item_id: &str) {
        if let Some(handle) = self.connections.get_mut(&conn) {
            if handle.current_item_id.as_deref() == Some(item_id) {
                handle.current_item_id = None;
            }
        }
        if self.playing_connection == Some(conn) {
            self.playing_connection = None;
        }
    }

    /// Disconnect handling: synthesize a failure for any item the departing
    /// connection was playing, then advance the queue.
    fn handle_disconnect(&mut self, conn: ConnId) {
        if let Some(handle) = self.connections.remove(&conn) {
            if let Some(item_id) = handle.current_item_id {
                self.queue.mark_failed(&item_id, "client_disconnected");
            }
        }
        self.order.retain(|c| *c != conn);
        if self.playing_connection == Some(conn) {
            self.playing_connection = None;
        }
        if let Some(pending) = &self.pending_transition {
            if pending.conn == conn {
                self.pending_transition = None;
            }
        }
        debug!(conn, "client disconnected");
        self.process_queue();
    }

    fn process_queue(&mut self) {
        if self.queue.is_playing() {
            return;
        }
        let Some(item) = self.queue.get_next() else {
            return;
        };
        self.drain_queue_events();

        let chosen = self
            .order
            .iter()
            .find(|id| {
                self.connections
                    .get(id)
                    .map(|h| h.current_item_id.is_none())
                    .unwrap_or(false)
            })
            .copied();

        let Some(conn) = chosen else {
            // No idle connection: reinstate the popped item. This requeues
            // the last-popped item rather than touching `current`.
            self.queue.handle_interruption(&item.id);
            self.drain_queue_events();
            return;
        };

        if self.queue.needs_speaker_transition(&item) {
            let sleep = Box::pin(tokio::time::sleep(self.config.speaker_transition()));
            self.pending_transition = Some(PendingTransition { conn, item, sleep });
        } else {
            self.send_play_now(conn, item);
        }
    }

    fn fire_speaker_transition(&mut self) {
        if let Some(pending) = self.pending_transition.take() {
            self.send_play_now(pending.conn, pending.item);
        }
    }

    fn send_play_now(&mut self, conn: ConnId, item: QueueItem) {
        if let Some(handle) = self.connections.get_mut(&conn) {
            handle.current_item_id = Some(item.id.clone());
            let _ = handle.tx.send(DaemonMessage::PlayNow {
                id: item.id.clone(),
                item,
            });
            self.playing_connection = Some(conn);
        }
    }

    /// Drain events broadcast synchronously by the last queue mutation and
    /// react to the ones the server cares about (aborts on preemption,
    /// logging on drop). Safe to call any number of times — it's
    /// non-blocking.
    fn drain_queue_events(&mut self) {
        loop {
            match self.queue_events.try_recv() {
                Ok(QueueEvent::Interrupted { current_id, .. }) => {
                    if let Some(conn) = self.playing_connection {
                        if self
                            .connections
                            .get(&conn)
                            .map(|h| h.current_item_id.as_deref() == Some(current_id.as_str()))
                            .unwrap_or(false)
                        {
                            self.respond(
                                conn,
                                DaemonMessage::Abort {
                                    id: current_id,
                                    reason: "preempted".into(),
                                },
                            );
                        }
                    }
                }
                Ok(QueueEvent::Dropped { id, reason }) => {
                    if reason == DropReason::Expired {
                        debug!(id = %id, "item expired before playing");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::TryRecvError::Empty) => break,
                Err(tokio::sync::broadcast::error::TryRecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "queue event receiver lagged");
                }
            }
        }
    }
}

/// Best-effort fallback for a line that failed to parse as `ClientMessage`:
/// pull `request_id` out as loosely-typed JSON so the caller's pending
/// request can still be failed immediately instead of timing out.
fn recover_request_id(line: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()?
        .get("request_id")?
        .as_str()
        .map(str::to_string)
}

async fn read_loop(
    conn: ConnId,
    read_half: tokio::net::unix::OwnedReadHalf,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ClientMessage>(&line) {
                    Ok(msg) => {
                        let _ = inbound_tx.send(Inbound::Message(conn, msg));
                    }
                    Err(e) => {
                        warn!(conn, error = %e, "malformed client message");
                        let request_id = recover_request_id(&line);
                        let _ = inbound_tx.send(Inbound::Malformed(conn, request_id));
                    }
                }
            }
            Ok(None) => {
                let _ = inbound_tx.send(Inbound::Disconnected(conn));
                break;
            }
            Err(e) => {
                warn!(conn, error = %e, "read error, treating as disconnect");
                let _ = inbound_tx.send(Inbound::Disconnected(conn));
                break;
            }
        }
    }
}

async fn write_loop(
    mut write_half: tokio::net::unix::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<DaemonMessage>,
) {
    while let Some(msg) = rx.recv().await {
        if write_line(&mut write_half, &msg).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
