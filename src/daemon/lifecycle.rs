//! Daemon lifecycle: pid file management, start/stop/liveness.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::VqdConfig;
use crate::error::DaemonError;
use crate::ipc::Server;

/// Write the current process id to `path`, truncating any existing file.
pub fn write_pid_file(path: &Path) -> Result<(), DaemonError> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::write(path, std::process::id().to_string()).map_err(|source| DaemonError::PidFile {
        path: path.to_path_buf(),
        source,
    })
}

fn read_pid_file(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    // No portable liveness probe outside Unix; treat the pid file's mere
    // existence as "probably running" and let socket connect attempts be
    // the real source of truth.
    true
}

/// True if a daemon appears to be running (pid file + socket present and
/// the pid is alive). Purges stale files otherwise.
pub fn is_daemon_running(config: &VqdConfig) -> bool {
    let Some(pid) = read_pid_file(&config.pid_file) else {
        return false;
    };
    if config.socket_path.exists() && process_alive(pid) {
        return true;
    }
    let _ = std::fs::remove_file(&config.pid_file);
    let _ = std::fs::remove_file(&config.socket_path);
    false
}

/// Spawn `vqd_binary --foreground` detached from the current process group,
/// then poll for the socket file to appear.
pub async fn start_daemon(
    vqd_binary: &Path,
    config_path: Option<&Path>,
    socket_path: &Path,
    timeout: Duration,
) -> Result<(), DaemonError> {
    let mut cmd = tokio::process::Command::new(vqd_binary);
    cmd.arg("--foreground");
    if let Some(p) = config_path {
        cmd.arg("--config").arg(p);
    }
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    let child = cmd.spawn().map_err(|source| DaemonError::SocketBind {
        path: socket_path.to_path_buf(),
        source,
    })?;
    // Detach: we don't want the daemon's lifetime tied to this process.
    std::mem::drop(child);

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if socket_path.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Err(DaemonError::SocketBind {
        path: socket_path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::TimedOut, "daemon did not start in time"),
    })
}

/// Send SIGTERM and wait (up to 5s) for the daemon to exit, then clean up
/// its pid file and socket.
#[cfg(unix)]
pub fn stop_daemon(config: &VqdConfig) -> Result<(), DaemonError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = read_pid_file(&config.pid_file) else {
        return Ok(());
    };
    if kill(Pid::from_raw(pid), Signal::SIGTERM).is_err() {
        let _ = std::fs::remove_file(&config.pid_file);
        let _ = std::fs::remove_file(&config.socket_path);
        return Ok(());
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if !process_alive(pid) {
            let _ = std::fs::remove_file(&config.pid_file);
            let _ = std::fs::remove_file(&config.socket_path);
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    Err(DaemonError::StopTimeout(pid))
}

#[cfg(not(unix))]
pub fn stop_daemon(config: &VqdConfig) -> Result<(), DaemonError> {
    let _ = std::fs::remove_file(&config.pid_file);
    let _ = std::fs::remove_file(&config.socket_path);
    Ok(())
}

/// Run the daemon in the foreground: bind the socket, install the pid
/// file, serve until SIGINT/SIGTERM, then clean up.
pub async fn run_foreground(config: VqdConfig) -> anyhow::Result<()> {
    write_pid_file(&config.pid_file)?;
    let listener = Server::bind(&config.socket_path)
        .await
        .map_err(|source| DaemonError::SocketBind {
            path: config.socket_path.clone(),
            source,
        })?;
    info!(socket = %config.socket_path.display(), "voice queue daemon listening");

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(wait_for_signal(shutdown_tx));

    let socket_path = config.socket_path.clone();
    let pid_file = config.pid_file.clone();
    let server = Server::new(config);
    server.run(listener, socket_path, shutdown_rx).await;

    let _ = std::fs::remove_file(&pid_file);
    info!("voice queue daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal(shutdown_tx: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = term.recv() => warn!("received SIGTERM"),
        _ = int.recv() => warn!("received SIGINT"),
    }
    let _ = shutdown_tx.send(()).await;
}

#[cfg(not(unix))]
async fn wait_for_signal(shutdown_tx: mpsc::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    let _ = shutdown_tx.send(()).await;
}
