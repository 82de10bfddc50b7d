//! `vqd` — the voice queue daemon.
//!
//! ```text
//! vqd --foreground [--config path.yaml] [--socket path] [--pid-file path]
//! vqd stop
//! vqd --dump-config
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vqd", version, about = "voice queue daemon")]
struct Cli {
    /// Path to a YAML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Run attached to the terminal instead of detaching.
    #[arg(long)]
    foreground: bool,
    /// Override the socket path from config.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Override the pid file path from config.
    #[arg(long)]
    pid_file: Option<PathBuf>,
    /// Print the resolved configuration as YAML and exit.
    #[arg(long)]
    dump_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Stop a running daemon.
    Stop,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = voxd::config::VqdConfig::load(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(pid_file) = cli.pid_file {
        config.pid_file = pid_file;
    }

    if cli.dump_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    if let Some(Command::Stop) = cli.command {
        voxd::daemon::stop_daemon(&config)?;
        return Ok(());
    }

    voxd::daemon::logging::init(&config.log_file, "info");

    if !cli.foreground {
        let vqd_binary = std::env::current_exe()?;
        voxd::daemon::start_daemon(
            &vqd_binary,
            cli.config.as_deref(),
            &config.socket_path,
            config.daemon_start_timeout(),
        )
        .await?;
        println!("vqd started, socket at {}", config.socket_path.display());
        return Ok(());
    }

    voxd::daemon::run_foreground(config).await
}
