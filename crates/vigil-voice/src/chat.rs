//! OpenAI-compatible chat completion client.

use crate::ApiEndpoint;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vigil_core::{BackendError, DialogueBackend, Speaker, Turn};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("rate limited by chat endpoint")]
    RateLimited,
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("response contained no message")]
    Empty,
}

impl From<ChatError> for BackendError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::RateLimited => BackendError::RateLimited,
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub endpoint: ApiEndpoint,
    pub model: String,
    pub system_prompt: String,
}

impl ChatConfig {
    pub fn new(endpoint: ApiEndpoint, model: impl Into<String>) -> Self {
        Self {
            endpoint,
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

fn role(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::Seed | Speaker::Subject => "user",
        Speaker::Assistant => "assistant",
    }
}

/// System prompt, then history oldest first, then the new prompt.
fn build_messages<'a>(system: &'a str, history: &'a [Turn], prompt: &'a str) -> Vec<Message<'a>> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message {
        role: "system",
        content: system,
    });
    messages.extend(history.iter().map(|turn| Message {
        role: role(turn.speaker),
        content: &turn.text,
    }));
    messages.push(Message {
        role: "user",
        content: prompt,
    });
    messages
}

fn parse_reply(body: &str) -> Result<String, ChatError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| ChatError::Parse(e.to_string()))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or(ChatError::Empty)
}

pub struct ChatClient {
    http: reqwest::blocking::Client,
    config: ChatConfig,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> Result<Self, ChatError> {
        let http = config
            .endpoint
            .http_client()
            .map_err(|e| ChatError::Client(e.to_string()))?;
        Ok(Self { http, config })
    }

    /// Send one completion request and return the first choice's text.
    pub fn complete(&self, prompt: &str, history: &[Turn]) -> Result<String, ChatError> {
        let url = self.config.endpoint.url("chat/completions");
        let request = ChatRequest {
            model: &self.config.model,
            messages: build_messages(&self.config.system_prompt, history, prompt),
        };

        tracing::debug!(
            model = %self.config.model,
            messages = request.messages.len(),
            "sending chat completion request"
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.endpoint.api_key)
            .json(&request)
            .send()
            .map_err(|e| ChatError::Request(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ChatError::RateLimited);
        }

        let body = response
            .text()
            .map_err(|e| ChatError::Request(e.to_string()))?;

        if !status.is_success() {
            return Err(ChatError::Server {
                status: status.as_u16(),
                message: body,
            });
        }

        parse_reply(&body)
    }
}

impl DialogueBackend for ChatClient {
    fn reply(&mut self, prompt: &str, history: &[Turn]) -> Result<String, BackendError> {
        self.complete(prompt, history).map_err(BackendError::from)
    }
}
