//! vigil-hw — Hardware abstraction for camera capture and microphone input.
//!
//! Provides V4L2-based camera streaming as a `FrameSource` and a cpal-based
//! microphone that records one endpointed utterance at a time.

pub mod camera;
pub mod frame;
pub mod microphone;

pub use camera::{Camera, CameraError, CaptureSession, DeviceInfo, PixelFormat};
pub use microphone::{list_input_devices, Microphone, MicrophoneError, RecordLimits, Utterance};
