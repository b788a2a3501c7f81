//! vigil-voice — Network and process adapters for the intervention dialogue.
//!
//! `ChatClient` implements `DialogueBackend` over an OpenAI-compatible
//! `/chat/completions` endpoint, `TranscriptionClient` turns recorded audio into
//! text via `/audio/transcriptions`, and `CommandSynthesizer` speaks through an
//! external TTS program. All calls block.

pub mod chat;
pub mod synth;
pub mod transcribe;

pub use chat::{ChatClient, ChatConfig, ChatError};
pub use synth::CommandSynthesizer;
pub use transcribe::{TranscribeError, TranscriptionClient, TranscriptionConfig};

use std::time::Duration;

/// Connection settings shared by the chat and transcription clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl ApiEndpoint {
    /// Full URL for a path under the base URL.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn http_client(&self) -> Result<reqwest::blocking::Client, reqwest::Error> {
        reqwest::blocking::Client::builder()
            .user_agent(concat!("vigil/", env!("CARGO_PKG_VERSION")))
            .timeout(self.timeout)
            .build()
    }
}
