//! V4L2 camera capture via the `v4l` crate.

use crate::frame;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Instant;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::capability::{Capabilities, Flags as CapabilityFlags};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{FourCC, Format};
use vigil_core::{AcquisitionError, Frame, FrameSource};

const STREAM_BUFFERS: u32 = 4;
const MAX_PROBED_NODES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    NotFound(String),
    #[error("{0} is in use by another process")]
    Busy(String),
    #[error("cannot open {path}: {message}")]
    Open { path: String, message: String },
    #[error("{0} is not a video capture device")]
    NotCapture(String),
    #[error("pixel format: {0}")]
    Format(String),
    #[error("frame read: {0}")]
    Read(String),
}

/// A capture device found by `Camera::list_devices`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the frame converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2; luma is every other byte.
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if [*b"Y16 ", *b"Y16\0"].contains(&fourcc.repr) {
            Some(Self::Y16)
        } else {
            None
        }
    }
}

/// An opened camera with its negotiated resolution and pixel format.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and request
    /// the given resolution. The driver may negotiate a different one.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::NotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, &e))?;

        let caps = capture_caps(&device).ok_or_else(|| CameraError::NotCapture(device_path.to_string()))?;
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "camera opened"
        );

        // Monochrome sensors answer a YUYV request with GREY or Y16.
        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let granted = device
            .set_format(&requested)
            .map_err(|e| CameraError::Format(format!("{width}x{height} YUYV rejected: {e}")))?;

        let fourcc = granted.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc)
            .ok_or_else(|| CameraError::Format(format!("driver offered {fourcc}, not YUYV/GREY/Y16")))?;

        if (granted.width, granted.height) != (width, height) {
            tracing::warn!(
                requested_width = width,
                requested_height = height,
                width = granted.width,
                height = granted.height,
                "driver changed capture resolution"
            );
        }
        tracing::info!(width = granted.width, height = granted.height, %fourcc, "capture format set");

        Ok(Self {
            device,
            width: granted.width,
            height: granted.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Start continuous capture. The stream stops when the session is dropped.
    pub fn stream(&self) -> Result<CaptureSession<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::Read(format!("mmap setup on {}: {e}", self.device_path)))?;

        tracing::debug!(device = %self.device_path, buffers = STREAM_BUFFERS, "capture stream started");

        Ok(CaptureSession {
            camera: self,
            stream,
        })
    }

    fn luma(&self, raw: &[u8]) -> Result<Vec<u8>, CameraError> {
        let (w, h) = (self.width, self.height);
        match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(raw, w, h),
            PixelFormat::Grey => frame::grey_to_grayscale(raw, w, h),
            PixelFormat::Y16 => frame::y16_to_grayscale(raw, w, h),
        }
        .map_err(|e| CameraError::Read(e.to_string()))
    }

    /// Capture-capable nodes among /dev/video0 through /dev/video{MAX_PROBED_NODES - 1}.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_PROBED_NODES)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let device = Device::with_path(&path).ok()?;
                let caps = capture_caps(&device)?;
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

fn open_error(path: &str, err: &std::io::Error) -> CameraError {
    match err.kind() {
        ErrorKind::ResourceBusy => CameraError::Busy(path.to_string()),
        _ => CameraError::Open {
            path: path.to_string(),
            message: err.to_string(),
        },
    }
}

/// Capabilities of `device`, if it can capture video.
fn capture_caps(device: &Device) -> Option<Capabilities> {
    device
        .query_caps()
        .ok()
        .filter(|caps| caps.capabilities.contains(CapabilityFlags::VIDEO_CAPTURE))
}

/// A running mmap capture stream on a `Camera`.
pub struct CaptureSession<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl CaptureSession<'_> {
    /// Dequeue the next buffer and convert it to a grayscale frame.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (raw, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::Read(format!("dequeue: {e}")))?;
        let sequence = meta.sequence;
        let data = self.camera.luma(raw)?;

        Ok(Frame {
            data,
            width: self.camera.width,
            height: self.camera.height,
            timestamp: Instant::now(),
            sequence,
        })
    }

    /// Discard frames while the sensor's auto-exposure settles.
    pub fn warm_up(&mut self, frames: usize) -> Result<(), CameraError> {
        if frames == 0 {
            return Ok(());
        }
        tracing::info!(count = frames, "discarding warmup frames");
        for _ in 0..frames {
            let frame = self.capture_frame()?;
            tracing::trace!(
                seq = frame.sequence,
                brightness = frame.avg_brightness(),
                "warmup frame"
            );
        }
        Ok(())
    }
}

impl FrameSource for CaptureSession<'_> {
    fn next_frame(&mut self) -> Result<Frame, AcquisitionError> {
        self.capture_frame()
            .map_err(|e| AcquisitionError::Capture(e.to_string()))
    }
}
