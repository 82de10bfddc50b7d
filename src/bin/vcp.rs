//! `vcp` — the voice capture pipeline: listens to a microphone,
//! segments speech with VAD, transcribes it, and hands transcripts to
//! whatever producer the queue daemon serves (persona/TTS selection is out
//! of scope here).

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

use voxd::audio::AudioInputStream;
use voxd::config::VcpConfig;
use voxd::pipeline::{Orchestrator, PipelineEvent};
use voxd::rpc::HelperEvent;
use voxd::stt::SttAdapter;
use voxd::vad::VadAdapter;

#[derive(Parser)]
#[command(name = "vcp", version, about = "voice capture pipeline")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Path to the PCM producer helper (microphone capture process).
    #[arg(long)]
    audio_source: PathBuf,
    /// Print the resolved configuration as YAML and exit.
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = VcpConfig::load(cli.config.as_deref())?;

    if cli.dump_config {
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    voxd::daemon::logging::init(&config.daemon.log_file, &config.daemon.log_level);

    let vad_helper = config
        .vad
        .helper_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("vad.helperPath must be set in config"))?;
    let stt_helper = config
        .stt
        .helper_path
        .clone()
        .ok_or_else(|| anyhow::anyhow!("stt.helperPath must be set in config"))?;

    let (vad_events_tx, mut vad_events_rx) = mpsc::unbounded_channel::<HelperEvent>();
    let (stt_events_tx, mut stt_events_rx) = mpsc::unbounded_channel::<HelperEvent>();
    tokio::spawn(async move { while vad_events_rx.recv().await.is_some() {} });
    tokio::spawn(async move { while stt_events_rx.recv().await.is_some() {} });

    let vad = VadAdapter::spawn(&vad_helper, config.vad.clone(), vad_events_tx).await?;
    let stt = SttAdapter::spawn(&stt_helper, config.stt.clone(), stt_events_tx).await?;

    let (mut orchestrator, mut events) = Orchestrator::new(config, vad, stt);
    orchestrator.add_handler(Box::new(|t| {
        info!(text = %t.text, "transcript");
        true
    }));

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let PipelineEvent::Error(e) = event {
                error!(error = %e, "pipeline error");
            }
        }
    });

    let (_stream, audio_rx) = AudioInputStream::spawn(
        &cli.audio_source,
        &[],
        Duration::from_secs(10),
    )
    .await?;

    orchestrator.run(audio_rx).await?;
    Ok(())
}
