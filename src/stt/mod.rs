//! Speech-to-text adapter: batch transcription of a finished segment plus a
//! chunked streaming mode, both over the subprocess RPC harness.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::audio::wav;
use crate::config::SttConfig;
use crate::error::RpcError;
use crate::rpc::{Harness, HelperEvent, STT_READY_TIMEOUT};

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptResult {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
    #[serde(default, rename = "languageConfidence")]
    pub language_confidence: Option<f32>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "processingTimeMs")]
    pub processing_time_ms: u64,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageDetection {
    pub language: String,
    pub confidence: f32,
}

/// What to hand the helper: either a path it reads itself, or raw samples
/// this adapter materializes to a temp WAV file first.
pub enum AudioSource<'a> {
    Path(&'a Path),
    Samples { samples: &'a [i16], sample_rate: u32, channels: u16 },
}

/// Deletes its backing file on drop, so a materialized temp WAV is cleaned
/// up whether `transcribe` succeeds or returns early on error.
struct TempWavGuard(PathBuf);

impl Drop for TempWavGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

type StreamEventTx = mpsc::UnboundedSender<serde_json::Value>;

pub struct SttAdapter {
    harness: Harness,
    stream_sessions: Arc<Mutex<HashMap<String, StreamEventTx>>>,
}

impl SttAdapter {
    pub async fn spawn(
        helper_path: &Path,
        _config: SttConfig,
        events_tx: mpsc::UnboundedSender<HelperEvent>,
    ) -> Result<Self, RpcError> {
        let stream_sessions: Arc<Mutex<HashMap<String, StreamEventTx>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel::<HelperEvent>();
        let harness = Harness::spawn("stt", helper_path, &[], &[], internal_tx).await?;

        let sessions = stream_sessions.clone();
        tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                if event.method == "stream_event" {
                    let session_id = event
                        .params
                        .get("session_id")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    if let Some(session_id) = session_id {
                        let tx = sessions.lock().unwrap().get(&session_id).cloned();
                        if let Some(tx) = tx {
                            let payload = event.params.get("event").cloned().unwrap_or(serde_json::Value::Null);
                            let _ = tx.send(payload);
                        }
                    }
                } else {
                    let _ = events_tx.send(event);
                }
            }
        });

        Ok(Self { harness, stream_sessions })
    }

    pub async fn initialize(&self) -> Result<(), RpcError> {
        self.harness.wait_ready(STT_READY_TIMEOUT).await
    }

    /// Batch transcription of a complete segment.
    pub async fn transcribe(
        &self,
        audio: AudioSource<'_>,
        language: Option<&str>,
        timeout: Duration,
    ) -> Result<TranscriptResult, RpcError> {
        let (path, _guard) = match audio {
            AudioSource::Path(p) => (p.to_path_buf(), None),
            AudioSource::Samples { samples, sample_rate, channels } => {
                let path = std::env::temp_dir().join(format!("voxd-stt-{}.wav", Uuid::new_v4()));
                std::fs::write(&path, wav::frame_wav(samples, sample_rate, channels))?;
                let guard = TempWavGuard(path.clone());
                (path, Some(guard))
            }
        };

        let result = self
            .harness
            .call(
                "transcribe",
                json!({ "audio_path": path.display().to_string(), "language": language }),
                timeout,
            )
            .await?;
        parse_transcript(result)
    }

    pub async fn detect_language(&self, audio: AudioSource<'_>) -> Result<LanguageDetection, RpcError> {
        let path = match audio {
            AudioSource::Path(p) => p.to_path_buf(),
            AudioSource::Samples { samples, sample_rate, channels } => {
                let path = std::env::temp_dir().join(format!("voxd-lang-{}.wav", Uuid::new_v4()));
                std::fs::write(&path, wav::frame_wav(samples, sample_rate, channels))?;
                path
            }
        };
        let result = self
            .harness
            .call(
                "detect_language",
                json!({ "audio_path": path.display().to_string() }),
                Duration::from_secs(5),
            )
            .await?;
        serde_json::from_value(result).map_err(RpcError::MalformedLine)
    }

    /// Streaming transcription: a session id is generated for this call,
    /// `start_stream` opens it on the helper side, then chunks from
    /// `chunk_rx` are pushed as `audio_chunk` notifications (the last one
    /// flagged `is_final`), spaced ~10ms apart so the helper isn't flooded.
    /// The helper pushes `stream_event` notifications back
    /// (`started`/`partial`/`completed`/`error`) which this call consumes
    /// until `completed`/`error` or `finish_timeout` elapses; on timeout it
    /// sends `cancel_stream` best-effort.
    pub async fn transcribe_stream(
        &self,
        mut chunk_rx: mpsc::Receiver<Vec<i16>>,
        language: Option<&str>,
        finish_timeout: Duration,
    ) -> Result<TranscriptResult, RpcError> {
        let session_id = Uuid::new_v4().to_string();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<serde_json::Value>();
        self.stream_sessions.lock().unwrap().insert(session_id.clone(), event_tx);

        let result = self.run_stream(&session_id, &mut chunk_rx, language, &mut event_rx, finish_timeout).await;
        self.stream_sessions.lock().unwrap().remove(&session_id);
        result
    }

    async fn run_stream(
        &self,
        session_id: &str,
        chunk_rx: &mut mpsc::Receiver<Vec<i16>>,
        language: Option<&str>,
        event_rx: &mut mpsc::UnboundedReceiver<serde_json::Value>,
        finish_timeout: Duration,
    ) -> Result<TranscriptResult, RpcError> {
        self.harness
            .call(
                "start_stream",
                json!({ "session_id": session_id, "options": { "language": language } }),
                Duration::from_secs(5),
            )
            .await?;

        let mut current = chunk_rx.recv().await;
        while let Some(chunk) = current {
            let next = chunk_rx.recv().await;
            let is_final = next.is_none();
            let chunk_base64 = wav::pcm_to_base64(&chunk);
            if let Err(e) = self
                .harness
                .notify(
                    "audio_chunk",
                    json!({ "session_id": session_id, "chunk_base64": chunk_base64, "is_final": is_final }),
                )
                .await
            {
                warn!(error = %e, "failed to push stream chunk");
            }
            if !is_final {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            current = next;
        }

        let outcome = tokio::time::timeout(finish_timeout, async {
            while let Some(event) = event_rx.recv().await {
                match event.get("type").and_then(|v| v.as_str()) {
                    Some("completed") => return Ok(event.get("result").cloned().unwrap_or(serde_json::Value::Null)),
                    Some("error") => {
                        let message = event
                            .get("message")
                            .and_then(|v| v.as_str())
                            .unwrap_or("stream error")
                            .to_string();
                        return Err(RpcError::RemoteError(message));
                    }
                    _ => continue,
                }
            }
            Err(RpcError::ProcessExited)
        })
        .await;

        match outcome {
            Ok(Ok(result)) => parse_transcript(result),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let _ = self.harness.notify("cancel_stream", json!({ "session_id": session_id })).await;
                Err(RpcError::RequestTimeout(finish_timeout))
            }
        }
    }

    pub async fn shutdown(&self) {
        self.harness.shutdown().await;
    }
}

fn parse_transcript(value: serde_json::Value) -> Result<TranscriptResult, RpcError> {
    serde_json::from_value(value).map_err(RpcError::MalformedLine)
}
