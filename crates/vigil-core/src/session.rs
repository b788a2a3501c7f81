//! Spoken intervention session.
//!
//! One session runs per drowsiness event: the backend is asked for an opening
//! line, then the driver alternates listen → classify → respond until the
//! subject says an exit keyword (or the optional session limit passes).
//!
//! Everything here blocks. `SpeechRecognizer::listen` in particular has no
//! timeout of its own; adapters bound it, and `SessionConfig::max_duration`
//! bounds the session as a whole, checked between turns.

use crate::types::StateView;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;

const SEED_PROMPT: &str = "너는 졸음방지를 위한 대화 서비스야. 지금 운전자의 졸음을 감지했어 최대한 졸음을 깰 수 있도록 대화를 하게 될거야. '너는 사용자의 졸음이 감지되어 대화를 시도합니다' 라고 시작하며 사용자의 응답에 따라 이야기를 진행해";
const CLOSING_LINE: &str = "대화를 종료합니다.";
const APOLOGY_LINE: &str = "요청 한도가 초과되었습니다. 잠시 후 다시 시도해 주세요.";
const NOT_UNDERSTOOD_LINE: &str = "이해하지 못했습니다.";
const UNAVAILABLE_LINE: &str = "API를 사용할 수 없습니다.";
const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(300);

// --- Collaborator contracts ---

/// Why an utterance could not be turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionFailure {
    /// Audio was captured but no words were recognised.
    NotUnderstood,
    /// The recognition service could not be reached.
    ServiceUnavailable,
    /// Nobody spoke before the listener gave up.
    NoSpeech,
}

/// Result of one listen call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recognition {
    Recognized(String),
    Failed(RecognitionFailure),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("dialogue backend rate limited")]
    RateLimited,
    #[error("dialogue backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("speech synthesis failed: {0}")]
pub struct SynthesisError(pub String);

/// Blocking speech-to-text: capture one utterance and transcribe it.
pub trait SpeechRecognizer {
    fn listen(&mut self) -> Recognition;
}

/// Blocking text-to-speech. Returns once playback has finished.
pub trait SpeechSynthesizer {
    fn speak(&mut self, text: &str) -> Result<(), SynthesisError>;
}

/// Conversational backend. `history` holds the session's earlier turns,
/// oldest first, and does not include `prompt`.
pub trait DialogueBackend {
    fn reply(&mut self, prompt: &str, history: &[Turn]) -> Result<String, BackendError>;
}

pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// --- Transcript ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    /// The opening instruction sent to the backend.
    Seed,
    Assistant,
    Subject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

/// Turns of the active session. Lives only as long as one `run()`.
#[derive(Debug, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn push(&mut self, speaker: Speaker, text: impl Into<String>) {
        self.turns.push(Turn {
            speaker,
            text: text.into(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

// --- Configuration ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Instruction sent to the backend to obtain the opening line.
    pub seed_prompt: String,
    /// Utterances that end the session, compared case-insensitively.
    pub exit_keywords: Vec<String>,
    pub closing_line: String,
    /// Spoken in place of a reply when the backend fails.
    pub apology_line: String,
    pub not_understood_line: String,
    pub unavailable_line: String,
    /// Upper bound on a whole session. `None` keeps listening until an exit keyword.
    pub max_duration: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            seed_prompt: SEED_PROMPT.to_string(),
            exit_keywords: vec!["종료".to_string(), "exit".to_string()],
            closing_line: CLOSING_LINE.to_string(),
            apology_line: APOLOGY_LINE.to_string(),
            not_understood_line: NOT_UNDERSTOOD_LINE.to_string(),
            unavailable_line: UNAVAILABLE_LINE.to_string(),
            max_duration: Some(DEFAULT_MAX_DURATION),
        }
    }
}

impl SessionConfig {
    fn failure_line(&self, reason: RecognitionFailure) -> &str {
        match reason {
            RecognitionFailure::NotUnderstood | RecognitionFailure::NoSpeech => {
                &self.not_understood_line
            }
            RecognitionFailure::ServiceUnavailable => &self.unavailable_line,
        }
    }
}

/// Whether `text` is one of the exit keywords.
///
/// Surrounding whitespace and trailing sentence punctuation are ignored, since
/// recognisers tend to append a full stop.
pub fn is_exit_command(text: &str, keywords: &[String]) -> bool {
    let normalized = text
        .trim()
        .trim_end_matches(['.', '!', '?', '。'])
        .trim()
        .to_lowercase();
    !normalized.is_empty()
        && keywords
            .iter()
            .any(|k| k.trim().to_lowercase() == normalized)
}

// --- Driver ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    ExitCommand,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub listens: usize,
    pub spoken: usize,
    pub backend_calls: usize,
    pub end: EndReason,
    pub elapsed: Duration,
}

pub struct SessionDriver<R, S, B> {
    config: SessionConfig,
    recognizer: R,
    synthesizer: S,
    backend: B,
    clock: Box<dyn Clock>,
    state: Rc<Cell<SessionState>>,
}

/// Counters accumulated during one `run()`.
#[derive(Default)]
struct Tally {
    listens: usize,
    spoken: usize,
    backend_calls: usize,
}

impl<R, S, B> SessionDriver<R, S, B>
where
    R: SpeechRecognizer,
    S: SpeechSynthesizer,
    B: DialogueBackend,
{
    pub fn new(config: SessionConfig, recognizer: R, synthesizer: S, backend: B) -> Self {
        Self {
            config,
            recognizer,
            synthesizer,
            backend,
            clock: Box::new(SystemClock),
            state: Rc::new(Cell::new(SessionState::Idle)),
        }
    }

    /// Replace the clock used for `max_duration`.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn state_view(&self) -> StateView<SessionState> {
        StateView::new(&self.state)
    }

    pub fn recognizer(&self) -> &R {
        &self.recognizer
    }

    pub fn synthesizer(&self) -> &S {
        &self.synthesizer
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one complete session. Blocks until it ends.
    pub fn run(&mut self) -> SessionSummary {
        self.state.set(SessionState::Active);
        let started = self.clock.now();
        let mut transcript = Transcript::default();
        let mut tally = Tally::default();

        tracing::info!("intervention session started");

        let seed = self.config.seed_prompt.clone();
        let opening = self.consult(&seed, Speaker::Seed, &mut transcript, &mut tally);
        self.say(&opening, &mut tally);

        let end = loop {
            if let Some(limit) = self.config.max_duration {
                if self.clock.now().saturating_duration_since(started) >= limit {
                    tracing::warn!(limit_secs = limit.as_secs(), "session time limit reached");
                    let closing = self.config.closing_line.clone();
                    self.say(&closing, &mut tally);
                    break EndReason::TimedOut;
                }
            }

            tally.listens += 1;
            match self.recognizer.listen() {
                Recognition::Recognized(text) => {
                    tracing::info!(speaker = "subject", text = %text);

                    if is_exit_command(&text, &self.config.exit_keywords) {
                        let closing = self.config.closing_line.clone();
                        self.say(&closing, &mut tally);
                        break EndReason::ExitCommand;
                    }

                    let reply = self.consult(&text, Speaker::Subject, &mut transcript, &mut tally);
                    self.say(&reply, &mut tally);
                }
                Recognition::Failed(reason) => {
                    tracing::debug!(?reason, "recognition failed; not forwarding to backend");
                    let line = self.config.failure_line(reason).to_string();
                    self.say(&line, &mut tally);
                }
            }
        };

        let elapsed = self.clock.now().saturating_duration_since(started);
        self.state.set(SessionState::Idle);

        tracing::info!(
            ?end,
            listens = tally.listens,
            turns = transcript.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "intervention session ended"
        );

        SessionSummary {
            listens: tally.listens,
            spoken: tally.spoken,
            backend_calls: tally.backend_calls,
            end,
            elapsed,
        }
    }

    /// Ask the backend for a reply to `prompt`, degrading to the apology line.
    fn consult(
        &mut self,
        prompt: &str,
        speaker: Speaker,
        transcript: &mut Transcript,
        tally: &mut Tally,
    ) -> String {
        tally.backend_calls += 1;
        let result = self.backend.reply(prompt, transcript.turns());
        transcript.push(speaker, prompt);

        match result {
            Ok(reply) => {
                transcript.push(Speaker::Assistant, reply.as_str());
                reply
            }
            Err(BackendError::RateLimited) => {
                tracing::warn!("dialogue backend rate limited; using apology line");
                self.config.apology_line.clone()
            }
            Err(err) => {
                tracing::warn!(error = %err, "dialogue backend failed; using apology line");
                self.config.apology_line.clone()
            }
        }
    }

    fn say(&mut self, text: &str, tally: &mut Tally) {
        tally.spoken += 1;
        tracing::info!(speaker = "assistant", text);
        if let Err(err) = self.synthesizer.speak(text) {
            tracing::warn!(error = %err, "speech synthesis failed; continuing session");
        }
    }
}
