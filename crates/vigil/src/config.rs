use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vigil_core::{DrowsinessConfig, EyeLandmarks, FaceMeshOptions, SessionConfig, MESH_LANDMARKS};
use vigil_hw::RecordLimits;
use vigil_voice::synth::DEFAULT_TTS_COMMAND;

const FACE_MESH_MODEL_FILE: &str = "face_landmark.onnx";
const FACE_DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

// Upper bounds keep every duration representable and `Instant` arithmetic in range.
const MAX_CLOSURE_SECS: f64 = 60.0;
const MAX_LISTEN_SECS: f64 = 600.0;
const MAX_HTTP_TIMEOUT_SECS: f64 = 600.0;
const MAX_SESSION_SECS: f64 = 86_400.0;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("{0} is above the maximum of {1}")]
    TooLarge(&'static str, f64),
    #[error("{key}: expected six comma-separated landmark indices, got '{value}'")]
    EyeIndices { key: &'static str, value: String },
    #[error("{key}: landmark index {index} is outside the {mesh}-point mesh", mesh = MESH_LANDMARKS)]
    EyeIndexRange { key: &'static str, index: usize },
}

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture resolution; the driver may negotiate another.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Explicit face mesh model path, overriding `model_dir`.
    pub face_mesh_model: Option<PathBuf>,
    /// Explicit SCRFD face detector path, overriding `model_dir`.
    pub face_detector_model: Option<PathBuf>,
    pub ear_threshold: f32,
    pub closure_secs: f32,
    /// Raw `VIGIL_LEFT_EYE` / `VIGIL_RIGHT_EYE` values, parsed by `eye_landmarks()`.
    pub left_eye: Option<String>,
    pub right_eye: Option<String>,
    pub presence_threshold: f32,
    pub channels_last: bool,
    /// OpenAI-compatible API base URL.
    pub api_base: String,
    pub api_key: String,
    pub chat_model: String,
    pub transcribe_model: String,
    pub language: String,
    pub http_timeout_secs: u64,
    pub tts_command: String,
    pub speech_timeout_secs: f32,
    pub max_utterance_secs: f32,
    pub silence_ms: u64,
    pub silence_rms: f32,
    /// Upper bound on one intervention session; 0 disables the bound.
    pub max_session_secs: u64,
    /// Show the preview window (0 runs headless).
    pub display: bool,
    /// Number of warmup frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("VIGIL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(vigil_core::default_model_dir);

        Self {
            camera_device: var("VIGIL_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            camera_width: parse_or(&var, "VIGIL_CAMERA_WIDTH", 640),
            camera_height: parse_or(&var, "VIGIL_CAMERA_HEIGHT", 480),
            model_dir,
            face_mesh_model: var("VIGIL_FACE_MESH_MODEL").map(PathBuf::from),
            face_detector_model: var("VIGIL_FACE_DETECTOR_MODEL").map(PathBuf::from),
            ear_threshold: parse_or(&var, "VIGIL_EAR_THRESHOLD", 0.25),
            closure_secs: parse_or(&var, "VIGIL_CLOSURE_SECS", 3.0),
            left_eye: var("VIGIL_LEFT_EYE"),
            right_eye: var("VIGIL_RIGHT_EYE"),
            presence_threshold: parse_or(&var, "VIGIL_PRESENCE_THRESHOLD", 0.5),
            channels_last: var("VIGIL_MODEL_NHWC").map(|v| v != "0").unwrap_or(true),
            api_base: var("VIGIL_API_BASE")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: var("VIGIL_API_KEY")
                .or_else(|| var("API_KEY"))
                .unwrap_or_default(),
            chat_model: var("VIGIL_CHAT_MODEL").unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
            transcribe_model: var("VIGIL_TRANSCRIBE_MODEL")
                .unwrap_or_else(|| "whisper-1".to_string()),
            language: var("VIGIL_LANGUAGE").unwrap_or_else(|| "ko".to_string()),
            http_timeout_secs: parse_or(&var, "VIGIL_HTTP_TIMEOUT_SECS", 30),
            tts_command: var("VIGIL_TTS_COMMAND")
                .unwrap_or_else(|| DEFAULT_TTS_COMMAND.to_string()),
            speech_timeout_secs: parse_or(&var, "VIGIL_SPEECH_TIMEOUT_SECS", 8.0),
            max_utterance_secs: parse_or(&var, "VIGIL_MAX_UTTERANCE_SECS", 15.0),
            silence_ms: parse_or(&var, "VIGIL_SILENCE_MS", 900),
            silence_rms: parse_or(&var, "VIGIL_SILENCE_RMS", 0.01),
            max_session_secs: parse_or(&var, "VIGIL_MAX_SESSION_SECS", 300),
            display: var("VIGIL_DISPLAY").map(|v| v != "0").unwrap_or(true),
            warmup_frames: parse_or(&var, "VIGIL_WARMUP_FRAMES", 4),
        }
    }

    /// Reject values the loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("VIGIL_EAR_THRESHOLD", self.ear_threshold),
            ("VIGIL_CLOSURE_SECS", self.closure_secs),
            ("VIGIL_PRESENCE_THRESHOLD", self.presence_threshold),
            ("VIGIL_SPEECH_TIMEOUT_SECS", self.speech_timeout_secs),
            ("VIGIL_MAX_UTTERANCE_SECS", self.max_utterance_secs),
            ("VIGIL_SILENCE_RMS", self.silence_rms),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NotPositive(name));
            }
        }
        if self.silence_ms == 0 {
            return Err(ConfigError::NotPositive("VIGIL_SILENCE_MS"));
        }
        for (name, value, max) in [
            ("VIGIL_EAR_THRESHOLD", f64::from(self.ear_threshold), 1.0),
            ("VIGIL_PRESENCE_THRESHOLD", f64::from(self.presence_threshold), 1.0),
            ("VIGIL_SILENCE_RMS", f64::from(self.silence_rms), 1.0),
            ("VIGIL_CLOSURE_SECS", f64::from(self.closure_secs), MAX_CLOSURE_SECS),
            ("VIGIL_SPEECH_TIMEOUT_SECS", f64::from(self.speech_timeout_secs), MAX_LISTEN_SECS),
            ("VIGIL_MAX_UTTERANCE_SECS", f64::from(self.max_utterance_secs), MAX_LISTEN_SECS),
            ("VIGIL_SILENCE_MS", self.silence_ms as f64, MAX_LISTEN_SECS * 1000.0),
            ("VIGIL_HTTP_TIMEOUT_SECS", self.http_timeout_secs as f64, MAX_HTTP_TIMEOUT_SECS),
            ("VIGIL_MAX_SESSION_SECS", self.max_session_secs as f64, MAX_SESSION_SECS),
        ] {
            if value > max {
                return Err(ConfigError::TooLarge(name, max));
            }
        }
        if self.camera_width == 0 || self.camera_height == 0 {
            return Err(ConfigError::NotPositive("VIGIL_CAMERA_WIDTH/HEIGHT"));
        }
        self.eye_landmarks()?;
        Ok(())
    }

    /// Path to the face mesh model.
    pub fn face_mesh_model_path(&self) -> String {
        self.face_mesh_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join(FACE_MESH_MODEL_FILE))
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the SCRFD face detector model.
    pub fn face_detector_model_path(&self) -> String {
        self.face_detector_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join(FACE_DETECTOR_MODEL_FILE))
            .to_string_lossy()
            .into_owned()
    }

    pub fn eye_landmarks(&self) -> Result<EyeLandmarks, ConfigError> {
        let mut eyes = EyeLandmarks::default();
        if let Some(value) = &self.left_eye {
            eyes.left = parse_eye("VIGIL_LEFT_EYE", value)?;
        }
        if let Some(value) = &self.right_eye {
            eyes.right = parse_eye("VIGIL_RIGHT_EYE", value)?;
        }
        Ok(eyes)
    }

    pub fn drowsiness(&self) -> DrowsinessConfig {
        DrowsinessConfig {
            ear_threshold: self.ear_threshold,
            closure_duration: Duration::from_secs_f32(self.closure_secs),
        }
    }

    pub fn face_mesh(&self) -> FaceMeshOptions {
        FaceMeshOptions {
            presence_threshold: self.presence_threshold,
            channels_last: self.channels_last,
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            max_duration: (self.max_session_secs > 0)
                .then(|| Duration::from_secs(self.max_session_secs)),
            ..SessionConfig::default()
        }
    }

    pub fn record_limits(&self) -> RecordLimits {
        RecordLimits {
            speech_timeout: Duration::from_secs_f32(self.speech_timeout_secs),
            silence: Duration::from_millis(self.silence_ms),
            max_utterance: Duration::from_secs_f32(self.max_utterance_secs),
            silence_rms: self.silence_rms,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parse_or<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    var(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_eye(key: &'static str, value: &str) -> Result<[usize; 6], ConfigError> {
    let bad = || ConfigError::EyeIndices {
        key,
        value: value.to_string(),
    };
    let indices: [usize; 6] = value
        .split(',')
        .map(|part| part.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| bad())?
        .try_into()
        .map_err(|_| bad())?;
    match indices.iter().find(|&&i| i >= MESH_LANDMARKS) {
        Some(&index) => Err(ConfigError::EyeIndexRange { key, index }),
        None => Ok(indices),
    }
}
