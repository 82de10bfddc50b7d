//! Subprocess JSON-RPC harness.
//!
//! Spawns a helper process (the VAD or STT interpreter), speaks JSON-RPC
//! 2.0 over its stdin/stdout, and correlates requests to responses the same
//! way the queue client correlates its own requests — a generated id and a
//! pending-oneshot map. A ready handshake gates the first call: the
//! helper is expected to emit a `{"method":"ready"}` notification once it
//! has finished loading its model.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::RpcError;

/// Default handshake timeout for helpers with a light startup cost (VAD).
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
/// STT helpers typically load a larger model; give them more room.
pub const STT_READY_TIMEOUT: Duration = Duration::from_secs(120);

const STDOUT_LINE_LIMIT: usize = 1024 * 1024;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObj {
    #[allow(dead_code)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcLine {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObj>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// A notification pushed by the helper (no correlating request), e.g. VAD's
/// `speech_start`/`speech_end`/`probability` stream events.
pub struct HelperEvent {
    pub method: String,
    pub params: Value,
}

/// A spawned helper process speaking JSON-RPC over stdio.
pub struct Harness {
    name: String,
    child: Mutex<Child>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    is_ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
    next_id: AtomicU64,
    reader_handle: JoinHandle<()>,
    stderr_handle: JoinHandle<()>,
}

impl Harness {
    /// Spawn `program` with `args`, wiring up the reader/stderr tasks.
    /// `events` receives any notification the helper pushes that isn't the
    /// `ready` handshake (stream events, diagnostics).
    pub async fn spawn(
        name: &str,
        program: &Path,
        args: &[String],
        env: &[(String, String)],
        events: tokio::sync::mpsc::UnboundedSender<HelperEvent>,
    ) -> Result<Self, RpcError> {
        if !program.exists() {
            return Err(RpcError::InterpreterNotFound(program.display().to_string()));
        }

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(env.iter().cloned())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(RpcError::SpawnFailed)?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let is_ready = Arc::new(AtomicBool::new(false));
        let ready_notify = Arc::new(Notify::new());

        let reader_handle = tokio::spawn(read_stdout(
            name.to_string(),
            stdout,
            pending.clone(),
            is_ready.clone(),
            ready_notify.clone(),
            events,
        ));
        let stderr_handle = tokio::spawn(read_stderr(name.to_string(), stderr));

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            is_ready,
            ready_notify,
            next_id: AtomicU64::new(1),
            reader_handle,
            stderr_handle,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    /// Wait for the `ready` handshake, polling rather than trusting a single
    /// notification in case it fired before this call subscribed.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), RpcError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_ready() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(RpcError::StartupTimeout(timeout));
            }
            let _ = tokio::time::timeout(remaining.min(Duration::from_millis(100)), self.ready_notify.notified()).await;
        }
        Ok(())
    }

    /// Call a method and wait for its correlated response.
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        if let Err(e) = self.write(Some(id), method, params).await {
            self.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::ProcessExited),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(RpcError::RequestTimeout(timeout))
            }
        }
    }

    /// Send a one-way notification; no response is awaited.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        self.write(None, method, params).await
    }

    async fn write(&self, id: Option<u64>, method: &str, params: Value) -> Result<(), RpcError> {
        let request = RpcRequest { jsonrpc: "2.0", id, method, params };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Best-effort graceful shutdown: ask nicely, then kill.
    pub async fn shutdown(&self) {
        let _ = self.call("shutdown", Value::Null, Duration::from_millis(500)).await;
        if let Ok(mut child) = self.child.lock() {
            let _ = child.start_kill();
        }
        self.reader_handle.abort();
        self.stderr_handle.abort();
        let mut pending = self.pending.lock().unwrap();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(RpcError::ProcessExited));
        }
        debug!(helper = %self.name, "shut down");
    }
}

async fn read_stdout(
    name: String,
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    is_ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
    events: tokio::sync::mpsc::UnboundedSender<HelperEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = lines.next_line().await;
        match next {
            Ok(Some(line)) => {
                if line.len() > STDOUT_LINE_LIMIT {
                    warn!(helper = %name, "stdout line exceeded limit, dropping");
                    continue;
                }
                if line.trim().is_empty() {
                    continue;
                }
                handle_line(&name, &line, &pending, &is_ready, &ready_notify, &events);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(helper = %name, error = %e, "stdout read error");
                break;
            }
        }
    }
    for (_, tx) in pending.lock().unwrap().drain() {
        let _ = tx.send(Err(RpcError::ProcessExited));
    }
}

fn handle_line(
    name: &str,
    line: &str,
    pending: &PendingMap,
    is_ready: &Arc<AtomicBool>,
    ready_notify: &Arc<Notify>,
    events: &tokio::sync::mpsc::UnboundedSender<HelperEvent>,
) {
    let parsed: RpcLine = match serde_json::from_str(line) {
        Ok(p) => p,
        Err(e) => {
            warn!(helper = %name, error = %e, "malformed RPC line");
            return;
        }
    };

    if let Some(id) = parsed.id {
        if parsed.method.is_none() {
            // A correlated response.
            let result = match parsed.error {
                Some(e) => Err(RpcError::RemoteError(e.message)),
                None => Ok(parsed.result.unwrap_or(Value::Null)),
            };
            if let Some(tx) = pending.lock().unwrap().remove(&id) {
                let _ = tx.send(result);
            }
            return;
        }
    }

    let Some(method) = parsed.method else {
        return;
    };
    if method == "ready" {
        is_ready.store(true, Ordering::Release);
        ready_notify.notify_waiters();
        return;
    }
    let _ = events.send(HelperEvent {
        method,
        params: parsed.params.unwrap_or(Value::Null),
    });
}

async fn read_stderr(name: String, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(helper = %name, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (PendingMap, Arc<AtomicBool>, Arc<Notify>, tokio::sync::mpsc::UnboundedSender<HelperEvent>, tokio::sync::mpsc::UnboundedReceiver<HelperEvent>) {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let is_ready = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (pending, is_ready, notify, tx, rx)
    }

    #[test]
    fn ready_line_flips_flag() {
        let (pending, is_ready, notify, tx, _rx) = fixtures();
        handle_line("helper", r#"{"method":"ready"}"#, &pending, &is_ready, &notify, &tx);
        assert!(is_ready.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn correlated_success_resolves_pending() {
        let (pending, is_ready, notify, tx, _rx) = fixtures();
        let (resolve_tx, resolve_rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, resolve_tx);

        handle_line(
            "helper",
            r#"{"id":7,"result":{"probability":0.9}}"#,
            &pending,
            &is_ready,
            &notify,
            &tx,
        );

        let value = resolve_rx.await.unwrap().unwrap();
        assert_eq!(value["probability"], 0.9);
    }

    #[tokio::test]
    async fn correlated_error_resolves_pending_as_err() {
        let (pending, is_ready, notify, tx, _rx) = fixtures();
        let (resolve_tx, resolve_rx) = oneshot::channel();
        pending.lock().unwrap().insert(3, resolve_tx);

        handle_line(
            "helper",
            r#"{"id":3,"error":{"code":-1,"message":"model not loaded"}}"#,
            &pending,
            &is_ready,
            &notify,
            &tx,
        );

        let err = resolve_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::RemoteError(m) if m == "model not loaded"));
    }

    #[tokio::test]
    async fn uncorrelated_notification_forwarded_as_event() {
        let (pending, is_ready, notify, tx, mut rx) = fixtures();
        handle_line(
            "helper",
            r#"{"method":"speech_start","params":{"ts":42}}"#,
            &pending,
            &is_ready,
            &notify,
            &tx,
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.method, "speech_start");
        assert_eq!(event.params["ts"], 42);
    }

    #[test]
    fn malformed_line_is_ignored_not_fatal() {
        let (pending, is_ready, notify, tx, _rx) = fixtures();
        handle_line("helper", "not json at all", &pending, &is_ready, &notify, &tx);
        assert!(!is_ready.load(Ordering::Acquire));
        assert!(pending.lock().unwrap().is_empty());
    }
}
