//! Speech-to-text via an OpenAI-compatible `/audio/transcriptions` endpoint.
//!
//! Audio is encoded as an in-memory 16-bit mono WAV and uploaded as multipart
//! form data.

use crate::ApiEndpoint;
use reqwest::blocking::multipart::{Form, Part};
use serde::Deserialize;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("failed to encode audio: {0}")]
    Encode(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub endpoint: ApiEndpoint,
    pub model: String,
    /// ISO-639-1 language hint, e.g. "ko".
    pub language: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Encode mono f32 samples in [-1, 1] as a 16-bit PCM WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, TranscribeError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).map_err(|e| TranscribeError::Encode(e.to_string()))?;
    for &sample in samples {
        let value = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer
            .write_sample(value)
            .map_err(|e| TranscribeError::Encode(e.to_string()))?;
    }
    writer
        .finalize()
        .map_err(|e| TranscribeError::Encode(e.to_string()))?;

    Ok(cursor.into_inner())
}

pub struct TranscriptionClient {
    http: reqwest::blocking::Client,
    config: TranscriptionConfig,
}

impl TranscriptionClient {
    pub fn new(config: TranscriptionConfig) -> Result<Self, TranscribeError> {
        let http = config
            .endpoint
            .http_client()
            .map_err(|e| TranscribeError::Client(e.to_string()))?;
        Ok(Self { http, config })
    }

    /// Transcribe one utterance. Returns the recognised text, trimmed; empty if
    /// the service heard no words.
    pub fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String, TranscribeError> {
        let wav = encode_wav(samples, sample_rate)?;
        let bytes = wav.len();

        let file = Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscribeError::Encode(e.to_string()))?;
        let form = Form::new()
            .text("model", self.config.model.clone())
            .text("language", self.config.language.clone())
            .part("file", file);

        tracing::debug!(bytes, model = %self.config.model, "sending transcription request");

        let response = self
            .http
            .post(self.config.endpoint.url("audio/transcriptions"))
            .bearer_auth(&self.config.endpoint.api_key)
            .multipart(form)
            .send()
            .map_err(|e| TranscribeError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| TranscribeError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(TranscribeError::Server {
                status: status.as_u16(),
                message: body,
            });
        }

        parse_transcription(&body)
    }
}

fn parse_transcription(body: &str) -> Result<String, TranscribeError> {
    let response: TranscriptionResponse =
        serde_json::from_str(body).map_err(|e| TranscribeError::Parse(e.to_string()))?;
    Ok(response.text.trim().to_string())
}
