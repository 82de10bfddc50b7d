//! Voice daemon orchestrator: the state machine wiring audio input, VAD,
//! the rolling buffer, and STT together into one capture loop.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::audio::buffer::{RollingBuffer, TimestampedChunk};
use crate::config::VcpConfig;
use crate::error::PipelineError;
use crate::stt::{AudioSource, SttAdapter, TranscriptResult};
use crate::vad::{VadAdapter, VadEvent};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    Listening,
    Capturing,
    Transcribing,
    Error,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChange(PipelineState),
    SpeechStart,
    SpeechEnd,
    Transcript(TranscriptResult),
    Error(String),
    Shutdown,
}

/// A transcript handler in the dispatch chain: returns `true` if it
/// consumed the transcript, stopping the chain (first-truthy-wins handler
/// order). Handlers that panic are caught and logged, not propagated — one
/// misbehaving handler shouldn't take down the pipeline.
pub type TranscriptHandler = Box<dyn Fn(&TranscriptResult) -> bool + Send + Sync>;

pub struct Orchestrator {
    state: PipelineState,
    vad: VadAdapter,
    stt: SttAdapter,
    buffer: RollingBuffer,
    handlers: Vec<TranscriptHandler>,
    events_tx: broadcast::Sender<PipelineEvent>,
    config: VcpConfig,
    speech_start_ts: Option<u64>,
    confidence_samples: Vec<f32>,
}

impl Orchestrator {
    pub fn new(config: VcpConfig, vad: VadAdapter, stt: SttAdapter) -> (Self, broadcast::Receiver<PipelineEvent>) {
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                state: PipelineState::Initializing,
                vad,
                stt,
                buffer: RollingBuffer::default(),
                handlers: Vec::new(),
                events_tx,
                config,
                speech_start_ts: None,
                confidence_samples: Vec::new(),
            },
            events_rx,
        )
    }

    /// Register a transcript handler. Handlers run in registration order;
    /// the first one to return `true` ends the chain for that transcript.
    pub fn add_handler(&mut self, handler: TranscriptHandler) {
        self.handlers.push(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Mean confidence across every transcript produced so far.
    pub fn mean_confidence(&self) -> f32 {
        if self.confidence_samples.is_empty() {
            return 0.0;
        }
        self.confidence_samples.iter().sum::<f32>() / self.confidence_samples.len() as f32
    }

    async fn initialize(&self) -> Result<(), PipelineError> {
        self.vad.initialize().await?;
        self.stt
            .initialize()
            .await
            .map_err(|e| PipelineError::Stt(e.to_string()))?;
        Ok(())
    }

    /// Drive the capture loop until `audio_rx` closes or a fatal error
    /// occurs. Pushes every chunk into the rolling buffer before handing it
    /// to the VAD, so a late-arriving `speech_start` can still recover
    /// lead-in audio from the buffer (the "tee").
    pub async fn run(&mut self, mut audio_rx: mpsc::Receiver<TimestampedChunk>) -> Result<(), PipelineError> {
        if let Err(e) = self.initialize().await {
            self.set_state(PipelineState::Error);
            self.emit(PipelineEvent::Error(e.to_string()));
            return Err(e);
        }
        self.set_state(PipelineState::Listening);

        while let Some(chunk) = audio_rx.recv().await {
            self.buffer.push(chunk.clone());

            let chunk_ms = chunk_duration_ms(chunk.samples.len(), self.config.audio.sample_rate);
            let events = match self
                .vad
                .process_chunk(&chunk.samples, self.config.audio.sample_rate, chunk_ms)
                .await
            {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "VAD call failed, dropping chunk");
                    continue;
                }
            };

            for event in events {
                self.handle_vad_event(event, chunk.timestamp_ms).await;
            }
        }

        self.set_state(PipelineState::ShuttingDown);
        self.emit(PipelineEvent::Shutdown);
        self.vad.dispose().await;
        self.stt.shutdown().await;
        Ok(())
    }

    async fn handle_vad_event(&mut self, event: VadEvent, chunk_ts: u64) {
        match event {
            VadEvent::Probability(_) => {}
            VadEvent::SpeechStart => {
                self.speech_start_ts = Some(chunk_ts);
                self.set_state(PipelineState::Capturing);
                self.emit(PipelineEvent::SpeechStart);
            }
            VadEvent::SpeechEnd { avg_probability } => {
                self.emit(PipelineEvent::SpeechEnd);
                self.set_state(PipelineState::Transcribing);
                self.finish_segment(chunk_ts, avg_probability).await;
                self.set_state(PipelineState::Listening);
            }
        }
    }

    async fn finish_segment(&mut self, end_ts: u64, avg_probability: f32) {
        let start_ts = self.speech_start_ts.take().unwrap_or(end_ts);
        let segment = self.buffer.extract_segment(start_ts, end_ts);
        if segment.is_empty() {
            return;
        }

        let max_duration = Duration::from_secs(self.config.daemon.max_speech_duration_secs);
        let result = self
            .stt
            .transcribe(
                AudioSource::Samples {
                    samples: &segment,
                    sample_rate: self.config.audio.sample_rate,
                    channels: self.config.audio.channels,
                },
                self.config.stt.language.as_deref(),
                max_duration,
            )
            .await;

        match result {
            Ok(transcript) => {
                self.confidence_samples.push(avg_probability);
                self.dispatch_transcript(&transcript);
                self.emit(PipelineEvent::Transcript(transcript));
            }
            Err(e) => {
                error!(error = %e, "transcription failed");
                self.emit(PipelineEvent::Error(e.to_string()));
            }
        }
    }

    fn dispatch_transcript(&self, transcript: &TranscriptResult) {
        for handler in &self.handlers {
            let handled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(transcript)))
                .unwrap_or_else(|_| {
                    error!("transcript handler panicked");
                    false
                });
            if handled {
                return;
            }
        }
        info!(text = %transcript.text, "transcript (no handler claimed it)");
    }

    fn set_state(&mut self, state: PipelineState) {
        self.state = state;
        self.emit(PipelineEvent::StateChange(state));
    }

    fn emit(&self, event: PipelineEvent) {
        let _ = self.events_tx.send(event);
    }
}

fn chunk_duration_ms(num_samples: usize, sample_rate: u32) -> u64 {
    (num_samples as u64 * 1000) / sample_rate.max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_duration_matches_sample_rate() {
        assert_eq!(chunk_duration_ms(512, 16_000), 32);
        assert_eq!(chunk_duration_ms(16_000, 16_000), 1000);
    }
}
