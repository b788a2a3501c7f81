//! Microphone capture via cpal with energy-based utterance endpointing.
//!
//! The input stream is built once and kept paused between utterances. During
//! `record` the audio callback forwards sample chunks over a channel and the
//! calling thread runs the endpointer until speech ends or a limit is hit.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use thiserror::Error;

const CHUNK_CHANNEL_CAPACITY: usize = 256;
const RECV_POLL: Duration = Duration::from_millis(100);
/// Extra wall-clock allowance over the sample-count limits before giving up
/// on a stream that has stopped delivering audio.
const STALL_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum MicrophoneError {
    #[error("no default input device available")]
    NoDevice,
    #[error("input config unavailable: {0}")]
    Config(String),
    #[error("failed to build input stream: {0}")]
    Stream(String),
    #[error("failed to start or pause input stream: {0}")]
    Playback(String),
    #[error("input stream stalled")]
    Stalled,
}

/// Bounds on a single utterance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordLimits {
    /// How long to wait for speech to start.
    pub speech_timeout: Duration,
    /// Trailing silence that ends an utterance.
    pub silence: Duration,
    /// Hard cap on utterance length.
    pub max_utterance: Duration,
    /// RMS level (on [-1, 1] samples) below which a chunk counts as silence.
    pub silence_rms: f32,
}

impl Default for RecordLimits {
    fn default() -> Self {
        Self {
            speech_timeout: Duration::from_secs(8),
            silence: Duration::from_millis(900),
            max_utterance: Duration::from_secs(15),
            silence_rms: 0.01,
        }
    }
}

/// Mono audio of one utterance. Empty when nobody spoke.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Utterance {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Listening,
    Speaking,
    /// Speech ended by trailing silence or the length cap.
    Complete,
    /// The speech timeout passed without any speech.
    NoSpeech,
}

/// Decides where an utterance starts and ends from mono sample chunks.
///
/// Time is measured in samples, so results do not depend on how the audio
/// callback happens to batch them.
pub struct Endpointer {
    limits: RecordLimits,
    sample_rate: u32,
    heard: usize,
    trailing_silence: usize,
    speech: Vec<f32>,
    state: Endpoint,
}

impl Endpointer {
    pub fn new(limits: RecordLimits, sample_rate: u32) -> Self {
        Self {
            limits,
            sample_rate,
            heard: 0,
            trailing_silence: 0,
            speech: Vec::new(),
            state: Endpoint::Listening,
        }
    }

    fn samples_for(&self, duration: Duration) -> usize {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as usize
    }

    pub fn push(&mut self, chunk: &[f32]) -> Endpoint {
        if chunk.is_empty() || matches!(self.state, Endpoint::Complete | Endpoint::NoSpeech) {
            return self.state;
        }

        let loud = rms(chunk) >= self.limits.silence_rms;
        self.heard += chunk.len();

        match self.state {
            Endpoint::Listening if loud => {
                tracing::debug!("speech started");
                self.state = Endpoint::Speaking;
                self.speech.extend_from_slice(chunk);
            }
            Endpoint::Listening => {
                if self.heard >= self.samples_for(self.limits.speech_timeout) {
                    self.state = Endpoint::NoSpeech;
                }
            }
            Endpoint::Speaking => {
                self.speech.extend_from_slice(chunk);
                if loud {
                    self.trailing_silence = 0;
                } else {
                    self.trailing_silence += chunk.len();
                }

                if self.trailing_silence >= self.samples_for(self.limits.silence) {
                    self.state = Endpoint::Complete;
                } else if self.speech.len() >= self.samples_for(self.limits.max_utterance) {
                    tracing::debug!("utterance length cap reached");
                    self.state = Endpoint::Complete;
                }
            }
            Endpoint::Complete | Endpoint::NoSpeech => {}
        }

        self.state
    }

    /// Captured speech so far; empty unless speech started.
    pub fn finish(self) -> Utterance {
        Utterance {
            samples: self.speech,
            sample_rate: self.sample_rate,
        }
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Names of the audio input devices on the default host.
#[allow(deprecated)] // cpal 0.17 deprecates name()
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let default = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .filter_map(|d| d.name().ok())
            .map(|name| {
                if default.as_deref() == Some(name.as_str()) {
                    format!("{name} (default)")
                } else {
                    name
                }
            })
            .collect(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to enumerate audio input devices");
            Vec::new()
        }
    }
}

/// Default system input device, opened once and reused for every utterance.
pub struct Microphone {
    stream: cpal::Stream,
    chunks: Receiver<Vec<f32>>,
    sample_rate: u32,
    channels: usize,
}

impl Microphone {
    #[allow(deprecated)] // cpal 0.17 deprecates name()
    pub fn open_default() -> Result<Self, MicrophoneError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(MicrophoneError::NoDevice)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let supported = device
            .default_input_config()
            .map_err(|e| MicrophoneError::Config(e.to_string()))?;
        let sample_rate = supported.sample_rate();
        let channels = supported.channels() as usize;

        let (tx, rx) = crossbeam_channel::bounded::<Vec<f32>>(CHUNK_CHANNEL_CAPACITY);
        let stream = device
            .build_input_stream(
                &supported.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if tx.try_send(data.to_vec()).is_err() {
                        tracing::trace!(samples = data.len(), "microphone chunk dropped");
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio input stream error");
                },
                None,
            )
            .map_err(|e| MicrophoneError::Stream(e.to_string()))?;

        stream
            .pause()
            .map_err(|e| MicrophoneError::Playback(e.to_string()))?;

        tracing::info!(device = %device_name, sample_rate, channels, "microphone opened");

        Ok(Self {
            stream,
            chunks: rx,
            sample_rate,
            channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Record one utterance. Blocks until speech ends or a limit is reached.
    pub fn record(&mut self, limits: &RecordLimits) -> Result<Utterance, MicrophoneError> {
        // Audio queued before this call belongs to an earlier turn.
        let stale = self.chunks.try_iter().count();
        if stale > 0 {
            tracing::trace!(chunks = stale, "discarded stale microphone audio");
        }

        self.stream
            .play()
            .map_err(|e| MicrophoneError::Playback(e.to_string()))?;

        let result = self.endpoint(limits);

        if let Err(err) = self.stream.pause() {
            tracing::warn!(error = %err, "failed to pause microphone");
        }

        let utterance = result?;
        tracing::debug!(
            samples = utterance.samples.len(),
            duration_ms = utterance.duration().as_millis() as u64,
            "utterance recorded"
        );
        Ok(utterance)
    }

    fn endpoint(&self, limits: &RecordLimits) -> Result<Utterance, MicrophoneError> {
        let mut endpointer = Endpointer::new(*limits, self.sample_rate);
        let deadline =
            Instant::now() + limits.speech_timeout + limits.max_utterance + STALL_GRACE;

        loop {
            match self.chunks.recv_timeout(RECV_POLL) {
                Ok(chunk) => {
                    let mono = downmix(&chunk, self.channels);
                    match endpointer.push(&mono) {
                        Endpoint::Complete | Endpoint::NoSpeech => return Ok(endpointer.finish()),
                        Endpoint::Listening | Endpoint::Speaking => {}
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(MicrophoneError::Stalled),
            }

            if Instant::now() >= deadline {
                return Err(MicrophoneError::Stalled);
            }
        }
    }
}
