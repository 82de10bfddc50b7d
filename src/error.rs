//! Error taxonomy for the voice coordination core.
//!
//! One `thiserror` enum per subsystem rather than a single catch-all: each
//! subsystem's errors are shaped differently (idempotent no-ops for the
//! queue, framing errors for IPC, spawn/timeout errors for the RPC
//! harness) and callers usually only care about one of them at a time.

use thiserror::Error;

/// Errors from the IPC wire protocol and the queue client library.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON line: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("not connected to daemon")]
    NotConnected,

    #[error("daemon did not start within {0:?}")]
    DaemonStartTimeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the subprocess JSON-RPC harness and the VAD/STT adapters
/// built on top of it.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("helper interpreter not found: {0}")]
    InterpreterNotFound(String),

    #[error("failed to spawn helper process: {0}")]
    SpawnFailed(std::io::Error),

    #[error("helper did not signal ready within {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("helper process exited")]
    ProcessExited,

    #[error("request timed out after {0:?}")]
    RequestTimeout(std::time::Duration),

    #[error("helper returned error: {0}")]
    RemoteError(String),

    #[error("malformed RPC line: {0}")]
    MalformedLine(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the audio input stream and rolling buffer.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("pending audio buffer overflowed {0} bytes")]
    BufferOverflow(usize),

    #[error("producer process exited")]
    ProducerExited,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("VAD error: {0}")]
    Vad(#[from] RpcError),

    #[error("audio input error: {0}")]
    Audio(#[from] AudioError),

    #[error("STT error: {0}")]
    Stt(String),
}

/// Errors from daemon lifecycle management and launch/discovery.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to write pid file {path}: {source}")]
    PidFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind socket {path}: {source}")]
    SocketBind {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon process {0} did not exit within the grace period")]
    StopTimeout(i32),
}

/// Errors from layered configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
