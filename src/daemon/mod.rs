//! Daemon lifecycle: process start/stop, pid file, logging setup.

pub mod lifecycle;
pub mod logging;

pub use lifecycle::{is_daemon_running, run_foreground, start_daemon, stop_daemon, write_pid_file};
