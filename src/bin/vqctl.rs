//! `vqctl` — command-line client for the voice queue daemon.
//!
//! ```text
//! vqctl enqueue "hello" --priority 50
//! vqctl cancel <id>
//! vqctl status
//! vqctl shutdown
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use voxd::client::QueueClient;
use voxd::queue::EnqueueRequest;

#[derive(Parser)]
#[command(name = "vqctl", version, about = "voice queue daemon client")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print the resolved configuration as YAML and exit.
    #[arg(long)]
    dump_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue an utterance.
    Enqueue {
        text: String,
        #[arg(long, default_value = "50")]
        priority: i32,
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// Cancel a queued item by id.
    Cancel { id: String },
    /// Print queue status.
    Status,
    /// Ask the daemon to shut down.
    Shutdown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = voxd::config::VqdConfig::load(cli.config.as_deref())?;

    if cli.dump_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let Some(command) = cli.command else {
        eprintln!("no subcommand given; try `vqctl status`");
        return Ok(());
    };

    let vqd_binary = {
        let mut p = std::env::current_exe()?;
        p.set_file_name("vqd");
        p
    };
    let client = QueueClient::connect(&config, &vqd_binary).await?;

    match command {
        Command::Enqueue { text, priority, agent_id } => {
            let (id, position) = client
                .enqueue(EnqueueRequest {
                    text,
                    priority,
                    voice_config: serde_json::Value::Null,
                    session_id: None,
                    agent_id,
                    timeout: None,
                })
                .await?;
            println!("queued {id} at position {position}");
        }
        Command::Cancel { id } => {
            client.cancel(&id).await?;
            println!("cancelled {id}");
        }
        Command::Status => {
            let (stats, health) = client.get_status().await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "stats": stats,
                "health": health,
            }))?);
        }
        Command::Shutdown => {
            client.request_shutdown().await?;
            println!("shutdown requested");
        }
    }

    Ok(())
}
