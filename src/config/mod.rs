//! Layered configuration: built-in defaults, overridden by a YAML file,
//! overridden by `VOXQ_*` environment variables.

pub mod paths;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::{InterruptionPolicy, Priority};

/// Interruption re-queue policy names as they appear in config.
fn default_interruption_policy() -> InterruptionPolicy {
    InterruptionPolicy::RequeueFront
}

/// Daemon-side configuration (VQD: queue, IPC server, lifecycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VqdConfig {
    #[serde(default = "paths::default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "paths::default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "paths::default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_wait_time_ms")]
    pub max_wait_time_ms: u64,
    #[serde(default = "default_interrupt_threshold")]
    pub interrupt_threshold: i32,
    #[serde(default = "default_interruption_policy")]
    pub interruption_policy: InterruptionPolicy,
    #[serde(default = "default_speaker_transition_ms")]
    pub speaker_transition_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_daemon_start_timeout_ms")]
    pub daemon_start_timeout_ms: u64,
}

fn default_max_queue_size() -> usize {
    50
}
fn default_max_wait_time_ms() -> u64 {
    30_000
}
fn default_interrupt_threshold() -> i32 {
    Priority::High as i32
}
fn default_speaker_transition_ms() -> u64 {
    300
}
fn default_connect_timeout_ms() -> u64 {
    1_000
}
fn default_daemon_start_timeout_ms() -> u64 {
    5_000
}

impl Default for VqdConfig {
    fn default() -> Self {
        Self {
            socket_path: paths::default_socket_path(),
            pid_file: paths::default_pid_file(),
            log_file: paths::default_log_file(),
            max_queue_size: default_max_queue_size(),
            max_wait_time_ms: default_max_wait_time_ms(),
            interrupt_threshold: default_interrupt_threshold(),
            interruption_policy: default_interruption_policy(),
            speaker_transition_ms: default_speaker_transition_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            daemon_start_timeout_ms: default_daemon_start_timeout_ms(),
        }
    }
}

impl VqdConfig {
    pub fn speaker_transition(&self) -> Duration {
        Duration::from_millis(self.speaker_transition_ms)
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn daemon_start_timeout(&self) -> Duration {
        Duration::from_millis(self.daemon_start_timeout_ms)
    }

    /// Load from an optional YAML file, then apply `VOXQ_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) if p.exists() => read_yaml(p)?,
            _ => Self::default(),
        };
        apply_env_overrides(&mut cfg);
        validate(&cfg)?;
        Ok(cfg)
    }
}

fn apply_env_overrides(cfg: &mut VqdConfig) {
    if let Ok(v) = std::env::var("VOXQ_SOCKET_PATH") {
        cfg.socket_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("VOXQ_PID_FILE") {
        cfg.pid_file = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("VOXQ_LOG_FILE") {
        cfg.log_file = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("VOXQ_MAX_QUEUE_SIZE") {
        if let Ok(n) = v.parse() {
            cfg.max_queue_size = n;
        }
    }
    if let Ok(v) = std::env::var("VOXQ_MAX_WAIT_TIME_MS") {
        if let Ok(n) = v.parse() {
            cfg.max_wait_time_ms = n;
        }
    }
    if let Ok(v) = std::env::var("VOXQ_INTERRUPT_THRESHOLD") {
        if let Ok(n) = v.parse() {
            cfg.interrupt_threshold = n;
        }
    }
    if let Ok(v) = std::env::var("VOXQ_INTERRUPTION_POLICY") {
        if let Some(policy) = parse_interruption_policy(&v) {
            cfg.interruption_policy = policy;
        }
    }
    if let Ok(v) = std::env::var("VOXQ_SPEAKER_TRANSITION_MS") {
        if let Ok(n) = v.parse() {
            cfg.speaker_transition_ms = n;
        }
    }
    if let Ok(v) = std::env::var("VOXQ_CONNECT_TIMEOUT_MS") {
        if let Ok(n) = v.parse() {
            cfg.connect_timeout_ms = n;
        }
    }
    if let Ok(v) = std::env::var("VOXQ_DAEMON_START_TIMEOUT_MS") {
        if let Ok(n) = v.parse() {
            cfg.daemon_start_timeout_ms = n;
        }
    }
}

fn parse_interruption_policy(v: &str) -> Option<InterruptionPolicy> {
    match v {
        "drop" => Some(InterruptionPolicy::Drop),
        "requeue_front" => Some(InterruptionPolicy::RequeueFront),
        "requeue_priority" => Some(InterruptionPolicy::RequeuePriority),
        _ => None,
    }
}

fn validate(cfg: &VqdConfig) -> Result<(), ConfigError> {
    if cfg.max_queue_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "maxQueueSize",
            reason: "must be at least 1".into(),
        });
    }
    Ok(())
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

// ---------------------------------------------------------------------
// Capture pipeline configuration (VCP: audio, VAD, STT, orchestrator)
// ---------------------------------------------------------------------

/// `audio` section of the YAML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_chunk_samples")]
    pub chunk_samples: usize,
    #[serde(default)]
    pub device: Option<String>,
}

fn default_sample_rate() -> u32 {
    16_000
}
fn default_channels() -> u16 {
    1
}
fn default_chunk_samples() -> usize {
    512
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            chunk_samples: default_chunk_samples(),
            device: None,
        }
    }
}

/// `vad` section of the YAML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VadConfig {
    #[serde(default)]
    pub helper_path: Option<PathBuf>,
    #[serde(default = "default_vad_threshold")]
    pub threshold: f32,
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_duration_ms: u64,
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_duration_ms: u64,
    #[serde(default = "default_speech_pad_ms")]
    pub speech_pad_ms: u64,
}

fn default_vad_threshold() -> f32 {
    0.5
}
fn default_min_speech_ms() -> u64 {
    250
}
fn default_min_silence_ms() -> u64 {
    1000
}
fn default_speech_pad_ms() -> u64 {
    300
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            helper_path: None,
            threshold: default_vad_threshold(),
            min_speech_duration_ms: default_min_speech_ms(),
            min_silence_duration_ms: default_min_silence_ms(),
            speech_pad_ms: default_speech_pad_ms(),
        }
    }
}

/// `stt` section of the YAML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SttConfig {
    #[serde(default)]
    pub helper_path: Option<PathBuf>,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub language: Option<String>,
}

fn default_model_name() -> String {
    "base".to_string()
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            helper_path: None,
            model_name: default_model_name(),
            language: None,
        }
    }
}

/// `daemon` section of the capture pipeline's YAML config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcpDaemonConfig {
    #[serde(default = "default_max_speech_duration_secs")]
    pub max_speech_duration_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "paths::default_log_file")]
    pub log_file: PathBuf,
}

fn default_max_speech_duration_secs() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for VcpDaemonConfig {
    fn default() -> Self {
        Self {
            max_speech_duration_secs: default_max_speech_duration_secs(),
            log_level: default_log_level(),
            log_file: paths::default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VcpConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub vad: VadConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub daemon: VcpDaemonConfig,
}

impl VcpConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) if p.exists() => read_yaml(p)?,
            _ => Self::default(),
        };
        apply_vcp_env_overrides(&mut cfg);
        validate_vcp(&cfg)?;
        Ok(cfg)
    }
}

fn apply_vcp_env_overrides(cfg: &mut VcpConfig) {
    if let Ok(v) = std::env::var("VOXQ_SAMPLE_RATE") {
        if let Ok(n) = v.parse() {
            cfg.audio.sample_rate = n;
        }
    }
    if let Ok(v) = std::env::var("VOXQ_CHANNELS") {
        if let Ok(n) = v.parse() {
            cfg.audio.channels = n;
        }
    }
    if let Ok(v) = std::env::var("VOXQ_AUDIO_DEVICE") {
        cfg.audio.device = Some(v);
    }
    if let Ok(v) = std::env::var("VOXQ_VAD_HELPER_PATH") {
        cfg.vad.helper_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("VOXQ_VAD_THRESHOLD") {
        if let Ok(n) = v.parse() {
            cfg.vad.threshold = n;
        }
    }
    if let Ok(v) = std::env::var("VOXQ_STT_HELPER_PATH") {
        cfg.stt.helper_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("VOXQ_STT_MODEL_NAME") {
        cfg.stt.model_name = v;
    }
    if let Ok(v) = std::env::var("VOXQ_STT_LANGUAGE") {
        cfg.stt.language = Some(v);
    }
    if let Ok(v) = std::env::var("VOXQ_LOG_LEVEL") {
        cfg.daemon.log_level = v;
    }
    if let Ok(v) = std::env::var("VOXQ_LOG_FILE") {
        cfg.daemon.log_file = PathBuf::from(v);
    }
}

fn validate_vcp(cfg: &VcpConfig) -> Result<(), ConfigError> {
    if !(8_000..=48_000).contains(&cfg.audio.sample_rate) {
        return Err(ConfigError::InvalidValue {
            field: "audio.sampleRate",
            reason: "must be between 8000 and 48000".into(),
        });
    }
    if !(1..=2).contains(&cfg.audio.channels) {
        return Err(ConfigError::InvalidValue {
            field: "audio.channels",
            reason: "must be 1 or 2".into(),
        });
    }
    if !(128..=4096).contains(&cfg.audio.chunk_samples) {
        return Err(ConfigError::InvalidValue {
            field: "audio.chunkSamples",
            reason: "must be between 128 and 4096".into(),
        });
    }
    if !(0.0..=1.0).contains(&cfg.vad.threshold) {
        return Err(ConfigError::InvalidValue {
            field: "vad.threshold",
            reason: "must be between 0.0 and 1.0".into(),
        });
    }
    if !(1..=300).contains(&cfg.daemon.max_speech_duration_secs) {
        return Err(ConfigError::InvalidValue {
            field: "daemon.maxSpeechDurationSecs",
            reason: "must be between 1 and 300".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vqd_defaults_match_spec() {
        let cfg = VqdConfig::default();
        assert_eq!(cfg.max_queue_size, 50);
        assert_eq!(cfg.max_wait_time_ms, 30_000);
        assert_eq!(cfg.interrupt_threshold, 80);
        assert_eq!(cfg.speaker_transition_ms, 300);
    }

    #[test]
    fn vcp_defaults_match_spec() {
        let cfg = VcpConfig::default();
        assert_eq!(cfg.audio.sample_rate, 16_000);
        assert_eq!(cfg.audio.channels, 1);
        assert_eq!(cfg.vad.threshold, 0.5);
        assert_eq!(cfg.vad.min_speech_duration_ms, 250);
        assert_eq!(cfg.vad.min_silence_duration_ms, 1000);
    }

    #[test]
    fn vcp_rejects_bad_sample_rate() {
        let mut cfg = VcpConfig::default();
        cfg.audio.sample_rate = 1_000;
        assert!(validate_vcp(&cfg).is_err());
    }

    #[test]
    fn vcp_rejects_bad_threshold() {
        let mut cfg = VcpConfig::default();
        cfg.vad.threshold = 1.5;
        assert!(validate_vcp(&cfg).is_err());
    }

    #[test]
    fn vqd_env_override_applies() {
        std::env::set_var("VOXQ_MAX_QUEUE_SIZE", "7");
        let mut cfg = VqdConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.max_queue_size, 7);
        std::env::remove_var("VOXQ_MAX_QUEUE_SIZE");
    }

    #[test]
    fn vqd_env_override_covers_interruption_fields() {
        std::env::set_var("VOXQ_SPEAKER_TRANSITION_MS", "999");
        std::env::set_var("VOXQ_INTERRUPTION_POLICY", "drop");
        let mut cfg = VqdConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.speaker_transition_ms, 999);
        assert_eq!(cfg.interruption_policy, InterruptionPolicy::Drop);
        std::env::remove_var("VOXQ_SPEAKER_TRANSITION_MS");
        std::env::remove_var("VOXQ_INTERRUPTION_POLICY");
    }

    #[test]
    fn vcp_env_override_applies() {
        std::env::set_var("VOXQ_VAD_THRESHOLD", "0.8");
        let mut cfg = VcpConfig::default();
        apply_vcp_env_overrides(&mut cfg);
        assert_eq!(cfg.vad.threshold, 0.8);
        std::env::remove_var("VOXQ_VAD_THRESHOLD");
    }
}
