//! Platform-specific default paths for sockets, pid files, and logs.
//!
//! Mirrors the XDG/APPDATA conventions used elsewhere in the example pack:
//!   Linux:   $XDG_RUNTIME_DIR (sockets/pid), $XDG_CONFIG_HOME (config/logs)
//!   macOS:   ~/Library/Application Support
//!   Windows: %APPDATA%

use std::path::PathBuf;

/// Base directory for per-run state (socket, pid file).
pub fn runtime_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        get_config_base().join("voxd").join("run")
    }

    #[cfg(not(target_os = "windows"))]
    {
        if let Some(xdg) = std::env::var_os("XDG_RUNTIME_DIR") {
            return PathBuf::from(xdg).join("voxd");
        }
        std::env::temp_dir().join("voxd")
    }
}

/// Base directory for configuration and logs.
pub fn config_dir() -> PathBuf {
    get_config_base().join("voxd")
}

fn get_config_base() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata);
        }
        dirs::config_dir().unwrap_or_else(|| PathBuf::from("."))
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Application Support")
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
    }
}

/// Default socket path for the voice queue daemon.
pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("vqd.sock")
}

/// Default pid file path for the voice queue daemon.
pub fn default_pid_file() -> PathBuf {
    runtime_dir().join("vqd.pid")
}

/// Default log file path shared by both binaries.
pub fn default_log_file() -> PathBuf {
    config_dir().join("logs").join("voxd.log")
}

/// Default YAML config file path.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.yaml")
}
