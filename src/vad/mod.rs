//! Voice activity detection adapter.
//!
//! The helper process only ever answers "what's the speech probability of
//! this frame" (a batch RPC call per chunk, via [`rpc::Harness`]); the
//! speech-start/speech-end hysteresis itself is local, synchronous state
//! kept in [`Hysteresis`] so it's unit-testable without a subprocess.

use std::path::Path;
use std::time::Duration;

use serde_json::json;

use crate::config::VadConfig;
use crate::error::RpcError;
use crate::rpc::{Harness, HelperEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    Probability(f32),
    SpeechStart,
    SpeechEnd { avg_probability: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    InSpeech,
}

/// Speech/silence hysteresis over a stream of per-chunk `is_speech`
/// decisions: `SpeechStart` fires immediately on the first above-threshold
/// chunk seen from `Idle`. `min_speech_duration_ms` only gates whether the
/// eventual `SpeechEnd` is worth yielding once a run of silence exceeding
/// `min_silence_duration_ms` closes the segment out — a speech run shorter
/// than that is dropped silently, same as if it had never started.
pub struct Hysteresis {
    config: VadConfig,
    phase: Phase,
    speech_ms: u64,
    silence_ms: u64,
    prob_accum: f64,
    prob_count: u32,
}

impl Hysteresis {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            speech_ms: 0,
            silence_ms: 0,
            prob_accum: 0.0,
            prob_count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.speech_ms = 0;
        self.silence_ms = 0;
        self.prob_accum = 0.0;
        self.prob_count = 0;
    }

    /// Feed one chunk's helper-reported `is_speech` decision, probability,
    /// and duration; returns the events it produced, in order.
    pub fn push(&mut self, is_speech: bool, probability: f32, chunk_ms: u64) -> Vec<VadEvent> {
        let mut events = vec![VadEvent::Probability(probability)];

        match self.phase {
            Phase::Idle => {
                if is_speech {
                    self.phase = Phase::InSpeech;
                    self.speech_ms = chunk_ms;
                    self.silence_ms = 0;
                    self.prob_accum = probability as f64;
                    self.prob_count = 1;
                    events.push(VadEvent::SpeechStart);
                }
            }
            Phase::InSpeech => {
                self.prob_accum += probability as f64;
                self.prob_count += 1;
                if is_speech {
                    self.speech_ms += chunk_ms;
                    self.silence_ms = 0;
                } else {
                    self.silence_ms += chunk_ms;
                }
                if self.silence_ms >= self.config.min_silence_duration_ms {
                    if self.speech_ms >= self.config.min_speech_duration_ms {
                        let avg = (self.prob_accum / self.prob_count.max(1) as f64) as f32;
                        events.push(VadEvent::SpeechEnd { avg_probability: avg });
                    }
                    self.phase = Phase::Idle;
                    self.speech_ms = 0;
                    self.silence_ms = 0;
                    self.prob_accum = 0.0;
                    self.prob_count = 0;
                }
            }
        }

        events
    }

    pub fn is_in_speech(&self) -> bool {
        self.phase == Phase::InSpeech
    }
}

/// The VAD helper adapter: a subprocess harness plus the local hysteresis.
pub struct VadAdapter {
    harness: Harness,
    hysteresis: Hysteresis,
}

impl VadAdapter {
    pub async fn spawn(
        helper_path: &Path,
        config: VadConfig,
        events_tx: tokio::sync::mpsc::UnboundedSender<HelperEvent>,
    ) -> Result<Self, RpcError> {
        let harness = Harness::spawn("vad", helper_path, &[], &[], events_tx).await?;
        Ok(Self {
            harness,
            hysteresis: Hysteresis::new(config),
        })
    }

    pub async fn initialize(&self) -> Result<(), RpcError> {
        self.harness.wait_ready(crate::rpc::DEFAULT_READY_TIMEOUT).await
    }

    /// Score one chunk of 16-bit PCM samples and advance the hysteresis.
    pub async fn process_chunk(
        &mut self,
        pcm: &[i16],
        sample_rate: u32,
        chunk_ms: u64,
    ) -> Result<Vec<VadEvent>, RpcError> {
        let audio_base64 = crate::audio::wav::pcm_to_base64(pcm);
        let result = self
            .harness
            .call(
                "process",
                json!({
                    "audio_base64": audio_base64,
                    "sample_rate": sample_rate,
                    "threshold": self.hysteresis.config.threshold,
                }),
                Duration::from_secs(2),
            )
            .await?;
        let probability = result
            .get("probability")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0) as f32;
        let is_speech = result
            .get("is_speech")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(self.hysteresis.push(is_speech, probability, chunk_ms))
    }

    pub fn reset(&mut self) {
        self.hysteresis.reset();
    }

    pub async fn dispose(&self) {
        self.harness.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> VadConfig {
        VadConfig {
            helper_path: None,
            threshold: 0.5,
            min_speech_duration_ms: 250,
            min_silence_duration_ms: 1000,
            speech_pad_ms: 300,
        }
    }

    /// `SpeechStart` fires on the very first above-threshold chunk, not
    /// after accumulating `min_speech_duration_ms` worth of run time.
    #[test]
    fn speech_start_fires_on_first_chunk() {
        let mut h = Hysteresis::new(cfg());
        let events = h.push(true, 0.9, 100);
        assert!(events.contains(&VadEvent::SpeechStart));
        assert!(h.is_in_speech());
    }

    /// A speech run shorter than `min_speech_duration_ms`, once silence
    /// closes it out, never yields `SpeechEnd` — the segment was too short
    /// to count even though `SpeechStart` already fired.
    #[test]
    fn short_speech_run_ends_without_speech_end() {
        let mut h = Hysteresis::new(cfg());
        let events = h.push(true, 0.9, 100);
        assert!(events.contains(&VadEvent::SpeechStart));

        let mut saw_end = false;
        for _ in 0..11 {
            let events = h.push(false, 0.1, 100);
            saw_end |= events.iter().any(|e| matches!(e, VadEvent::SpeechEnd { .. }));
        }
        assert!(!saw_end);
        assert!(!h.is_in_speech());
    }

    #[test]
    fn sustained_speech_triggers_start_then_end() {
        let mut h = Hysteresis::new(cfg());
        let mut saw_start = false;
        for _ in 0..4 {
            let events = h.push(true, 0.9, 100);
            saw_start |= events.contains(&VadEvent::SpeechStart);
        }
        assert!(saw_start);
        assert!(h.is_in_speech());

        let mut end_probability = None;
        for _ in 0..11 {
            let events = h.push(false, 0.1, 100);
            for e in events {
                if let VadEvent::SpeechEnd { avg_probability } = e {
                    end_probability = Some(avg_probability);
                }
            }
        }
        assert!(end_probability.is_some());
        assert!(!h.is_in_speech());
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut h = Hysteresis::new(cfg());
        for _ in 0..4 {
            h.push(true, 0.9, 100);
        }
        assert!(h.is_in_speech());
        h.reset();
        assert!(!h.is_in_speech());
    }
}
