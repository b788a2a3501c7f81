use vigil_core::{Recognition, RecognitionFailure, SpeechRecognizer};
use vigil_hw::{Microphone, RecordLimits};
use vigil_voice::{TranscribeError, TranscriptionClient};

/// Records one utterance from the microphone and transcribes it.
pub struct MicrophoneListener {
    microphone: Microphone,
    transcriber: TranscriptionClient,
    limits: RecordLimits,
}

impl MicrophoneListener {
    pub fn new(microphone: Microphone, transcriber: TranscriptionClient, limits: RecordLimits) -> Self {
        Self {
            microphone,
            transcriber,
            limits,
        }
    }
}

impl SpeechRecognizer for MicrophoneListener {
    fn listen(&mut self) -> Recognition {
        tracing::info!("listening");

        let utterance = match self.microphone.record(&self.limits) {
            Ok(utterance) => utterance,
            Err(err) => {
                tracing::error!(error = %err, "microphone capture failed");
                return Recognition::Failed(RecognitionFailure::ServiceUnavailable);
            }
        };

        if utterance.is_empty() {
            tracing::debug!("no speech before timeout");
            return Recognition::Failed(RecognitionFailure::NoSpeech);
        }

        classify(
            self.transcriber
                .transcribe(&utterance.samples, utterance.sample_rate),
        )
    }
}

fn classify(result: Result<String, TranscribeError>) -> Recognition {
    match result {
        Ok(text) if text.trim().is_empty() => Recognition::Failed(RecognitionFailure::NotUnderstood),
        Ok(text) => Recognition::Recognized(text),
        Err(err) => {
            tracing::warn!(error = %err, "transcription failed");
            Recognition::Failed(RecognitionFailure::ServiceUnavailable)
        }
    }
}
