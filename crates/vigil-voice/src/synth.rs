//! Text-to-speech through an external command such as `espeak-ng`.
//!
//! The text is passed as the final argument and the call waits for the
//! process to exit, so playback has finished when `speak` returns.

use std::process::{Command, Stdio};
use vigil_core::{SpeechSynthesizer, SynthesisError};

pub const DEFAULT_TTS_COMMAND: &str = "espeak-ng -v ko";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
}

impl CommandSynthesizer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line. `None` if it is blank.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self, text: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        command
    }
}

impl Default for CommandSynthesizer {
    fn default() -> Self {
        Self::new("espeak-ng", vec!["-v".to_string(), "ko".to_string()])
    }
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn speak(&mut self, text: &str) -> Result<(), SynthesisError> {
        if text.trim().is_empty() {
            return Ok(());
        }

        let status = self
            .command(text)
            .status()
            .map_err(|e| SynthesisError(format!("failed to run {}: {e}", self.program)))?;

        if status.success() {
            Ok(())
        } else {
            Err(SynthesisError(format!("{} exited with {status}", self.program)))
        }
    }
}
