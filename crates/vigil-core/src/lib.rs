//! vigil-core — Eye-closure drowsiness detection and spoken intervention.
//!
//! Landmarks come from the MediaPipe face mesh running on ONNX Runtime, seeded
//! by an SCRFD face detector when no face is being tracked. The
//! eye aspect ratio is debounced into drowsiness events, and each event runs
//! a blocking voice conversation before capture resumes.

pub mod controller;
pub mod debouncer;
pub mod detector;
pub mod facemesh;
pub mod geometry;
pub mod session;
pub mod types;

pub use controller::{
    AcquisitionError, ControllerError, FrameLoop, FrameOutcome, FrameSource, LandmarkDetector,
    LoopState, QuitSignal, Renderer, Shutdown,
};
pub use debouncer::{DebounceEvent, Debouncer, DrowsinessConfig};
pub use detector::{DetectorError, FaceDetector};
pub use facemesh::{FaceMesh, FaceMeshError, FaceMeshOptions, MESH_LANDMARKS};
pub use geometry::{eye_aspect_ratio, EyeLandmarks, GeometryError};
pub use session::{
    BackendError, Clock, DialogueBackend, EndReason, Recognition, RecognitionFailure,
    SessionConfig, SessionDriver, SessionState, SessionSummary, Speaker, SpeechRecognizer,
    SpeechSynthesizer, SynthesisError, SystemClock, Turn,
};
pub use types::{FaceBox, Frame, LandmarkSet, Point, StateView};

/// Default directory for the ONNX models, used when no override is configured.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/vigil/models")
}
