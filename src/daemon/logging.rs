//! Structured logging setup, shared by `vqd` and `vcp`.
//!
//! Rolling file output plus a human-readable console layer, filtered by
//! `RUST_LOG` (defaulting to the configured level).

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing for a long-running binary (`vqd`, `vcp`).
///
/// `log_file`'s parent directory is created if missing. Panics if a
/// subscriber is already installed — callers should only invoke this once,
/// at process start.
pub fn init(log_file: &Path, default_level: &str) {
    if let Some(parent) = log_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file_appender = tracing_appender::rolling::daily(
        log_file.parent().unwrap_or_else(|| Path::new(".")),
        log_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "voxd.log".to_string()),
    );

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true);

    let console_layer = fmt::layer().with_writer(std::io::stderr).compact();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();
}
