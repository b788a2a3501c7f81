//! MediaPipe face mesh landmark model via ONNX Runtime.
//!
//! The model takes a 192×192 RGB crop and returns 468 (x, y, z) landmarks in
//! crop pixels plus a single face-presence logit. The crop follows the face:
//! each successful frame's landmark bounds, expanded, become the next frame's
//! region of interest. With nothing tracked, the face detector's top box seeds
//! the crop; without a detector the whole frame is used.

use crate::controller::LandmarkDetector;
use crate::detector::{DetectorError, FaceDetector};
use crate::types::{FaceBox, Frame, LandmarkSet, Point};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const MESH_INPUT_SIZE: usize = 192;
/// Landmarks per face produced by the mesh model.
pub const MESH_LANDMARKS: usize = 468;
const MESH_COORDS: usize = 3;
/// How much larger than the landmark bounds the next crop is.
const ROI_EXPANSION: f32 = 1.5;
const DEFAULT_PRESENCE_THRESHOLD: f32 = 0.5;
/// Crops smaller than this are treated as lost tracking.
const MIN_ROI_SIZE: f32 = 24.0;

#[derive(Error, Debug)]
pub enum FaceMeshError {
    #[error("model file not found: {0} — export MediaPipe face_landmark to ONNX and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceMeshOptions {
    /// Sigmoid of the presence logit must reach this for a face to count.
    pub presence_threshold: f32,
    /// NHWC input (TFLite conversions) rather than NCHW.
    pub channels_last: bool,
}

impl Default for FaceMeshOptions {
    fn default() -> Self {
        Self {
            presence_threshold: DEFAULT_PRESENCE_THRESHOLD,
            channels_last: true,
        }
    }
}

/// Square crop in frame pixel coordinates. May extend past the frame edges.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Roi {
    x: f32,
    y: f32,
    size: f32,
}

impl Roi {
    /// Square covering the whole frame, centred.
    fn full_frame(width: u32, height: u32) -> Self {
        let size = width.max(height) as f32;
        Self {
            x: (width as f32 - size) / 2.0,
            y: (height as f32 - size) / 2.0,
            size,
        }
    }

    /// Expanded square around a landmark set, or `None` if too small to track.
    fn around(landmarks: &LandmarkSet) -> Option<Self> {
        let (x0, y0, x1, y1) = landmarks.bounds()?;
        Self::expanded(x0, y0, x1, y1)
    }

    /// Expanded square around a detector box, or `None` if too small to track.
    fn around_box(face: &FaceBox) -> Option<Self> {
        Self::expanded(face.x, face.y, face.x + face.width, face.y + face.height)
    }

    fn expanded(x0: f32, y0: f32, x1: f32, y1: f32) -> Option<Self> {
        let size = (x1 - x0).max(y1 - y0) * ROI_EXPANSION;
        if !(size.is_finite() && size >= MIN_ROI_SIZE) {
            return None;
        }
        let cx = (x0 + x1) / 2.0;
        let cy = (y0 + y1) / 2.0;
        Some(Self {
            x: cx - size / 2.0,
            y: cy - size / 2.0,
            size,
        })
    }

    /// Map a point in model input pixels back to frame pixels.
    fn to_frame(&self, x: f32, y: f32) -> Point {
        let scale = self.size / MESH_INPUT_SIZE as f32;
        Point::new(self.x + x * scale, self.y + y * scale)
    }
}

pub struct FaceMesh {
    session: Session,
    options: FaceMeshOptions,
    num_outputs: usize,
    /// (landmarks, presence) output indices, discovered on the first run.
    output_indices: Option<(usize, usize)>,
    tracked: Option<Roi>,
    detector: Option<FaceDetector>,
}

impl FaceMesh {
    /// Load the face mesh ONNX model from the given path.
    pub fn load(model_path: &str, options: FaceMeshOptions) -> Result<Self, FaceMeshError> {
        if !Path::new(model_path).exists() {
            return Err(FaceMeshError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            channels_last = options.channels_last,
            "loaded face mesh model"
        );

        if num_outputs < 2 {
            return Err(FaceMeshError::InferenceFailed(format!(
                "face mesh model requires landmark and presence outputs, got {num_outputs}"
            )));
        }

        Ok(Self {
            session,
            options,
            num_outputs,
            output_indices: None,
            tracked: None,
            detector: None,
        })
    }

    /// Use `detector` to find the face whenever nothing is tracked.
    pub fn with_detector(mut self, detector: FaceDetector) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Landmarks of the most prominent face, or `None` when no face is present.
    pub fn detect_face(&mut self, frame: &Frame) -> Result<Option<LandmarkSet>, FaceMeshError> {
        let roi = match self.tracked {
            Some(roi) => roi,
            None => {
                let boxes = match self.detector.as_mut() {
                    Some(detector) => Some(detector.detect(frame)?),
                    None => None,
                };
                match initial_roi(boxes.as_deref(), frame.width, frame.height) {
                    Some(roi) => roi,
                    None => return Ok(None),
                }
            }
        };
        let input = preprocess(
            &frame.data,
            frame.width as usize,
            frame.height as usize,
            roi,
            self.options.channels_last,
        );

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (landmark_idx, presence_idx) = match self.output_indices {
            Some(indices) => indices,
            None => {
                let mut lens = Vec::with_capacity(self.num_outputs);
                for i in 0..self.num_outputs {
                    let (_, data) = outputs[i]
                        .try_extract_tensor::<f32>()
                        .map_err(|e| FaceMeshError::InferenceFailed(format!("output {i}: {e}")))?;
                    lens.push(data.len());
                }
                let indices = discover_output_indices(&lens).ok_or_else(|| {
                    FaceMeshError::InferenceFailed(format!(
                        "no landmark/presence outputs among element counts {lens:?}"
                    ))
                })?;
                tracing::debug!(?indices, "face mesh output tensor mapping");
                self.output_indices = Some(indices);
                indices
            }
        };

        let (_, presence) = outputs[presence_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| FaceMeshError::InferenceFailed(format!("presence: {e}")))?;
        let score = sigmoid(presence.first().copied().unwrap_or(f32::NEG_INFINITY));

        if score < self.options.presence_threshold {
            if self.tracked.take().is_some() {
                tracing::debug!(score, "face lost; reacquiring");
            }
            return Ok(None);
        }

        let (_, raw) = outputs[landmark_idx]
            .try_extract_tensor::<f32>()
            .map_err(|e| FaceMeshError::InferenceFailed(format!("landmarks: {e}")))?;
        let landmarks = decode_landmarks(raw, &roi);

        self.tracked = Roi::around(&landmarks);
        tracing::trace!(score, roi = ?self.tracked, "face tracked");

        Ok(Some(landmarks))
    }

    /// Forget the tracked region; the next frame reacquires the face.
    pub fn reset_tracking(&mut self) {
        self.tracked = None;
    }
}

impl LandmarkDetector for FaceMesh {
    type Error = FaceMeshError;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<LandmarkSet>, FaceMeshError> {
        Ok(self.detect_face(frame)?.into_iter().collect())
    }

    fn reset(&mut self) {
        self.reset_tracking();
    }
}

/// Crop to start tracking from. `boxes` is `None` when no detector is loaded.
fn initial_roi(boxes: Option<&[FaceBox]>, width: u32, height: u32) -> Option<Roi> {
    match boxes {
        None => Some(Roi::full_frame(width, height)),
        Some(boxes) => boxes.first().and_then(Roi::around_box),
    }
}

/// Find (landmarks, presence) among output element counts.
///
/// Exports name these tensors inconsistently ("Identity", "conv2d_21", ...),
/// but the shapes are fixed: 1404 landmark values and a single logit.
fn discover_output_indices(lens: &[usize]) -> Option<(usize, usize)> {
    let landmarks = lens.iter().position(|&n| n == MESH_LANDMARKS * MESH_COORDS)?;
    let presence = lens
        .iter()
        .enumerate()
        .position(|(i, &n)| i != landmarks && n == 1)?;
    Some((landmarks, presence))
}

fn decode_landmarks(raw: &[f32], roi: &Roi) -> LandmarkSet {
    let points = raw
        .chunks_exact(MESH_COORDS)
        .take(MESH_LANDMARKS)
        .map(|c| roi.to_frame(c[0], c[1]))
        .collect();
    LandmarkSet::new(points)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Crop `roi` out of a grayscale frame into a 192×192 three-channel tensor in [0, 1].
///
/// Bilinear sampling; pixels outside the frame read as black.
fn preprocess(frame: &[u8], width: usize, height: usize, roi: Roi, channels_last: bool) -> Array4<f32> {
    let n = MESH_INPUT_SIZE;
    let mut tensor = if channels_last {
        Array4::<f32>::zeros((1, n, n, 3))
    } else {
        Array4::<f32>::zeros((1, 3, n, n))
    };

    let step = roi.size / n as f32;
    for y in 0..n {
        let src_y = roi.y + (y as f32 + 0.5) * step - 0.5;
        for x in 0..n {
            let src_x = roi.x + (x as f32 + 0.5) * step - 0.5;
            let val = sample_bilinear(frame, width, height, src_x, src_y) / 255.0;
            for c in 0..3 {
                if channels_last {
                    tensor[[0, y, x, c]] = val;
                } else {
                    tensor[[0, c, y, x]] = val;
                }
            }
        }
    }

    tensor
}

pub(crate) fn sample_bilinear(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let pixel = |px: f32, py: f32| -> f32 {
        if px < 0.0 || py < 0.0 || px >= width as f32 || py >= height as f32 {
            return 0.0;
        }
        frame
            .get(py as usize * width + px as usize)
            .map_or(0.0, |&v| v as f32)
    };

    pixel(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + pixel(x0 + 1.0, y0) * fx * (1.0 - fy)
        + pixel(x0, y0 + 1.0) * (1.0 - fx) * fy
        + pixel(x0 + 1.0, y0 + 1.0) * fx * fy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_frame_roi_centres_square() {
        let roi = Roi::full_frame(640, 480);
        assert_eq!(roi, Roi { x: 0.0, y: -80.0, size: 640.0 });
    }

    #[test]
    fn test_roi_around_landmarks() {
        let set = LandmarkSet::new(vec![
            Point::new(100.0, 100.0),
            Point::new(200.0, 160.0),
        ]);
        let roi = Roi::around(&set).unwrap();
        // 100 wide → 150 square centred on (150, 130).
        assert!((roi.size - 150.0).abs() < 1e-4);
        assert!((roi.x - 75.0).abs() < 1e-4);
        assert!((roi.y - 55.0).abs() < 1e-4);
    }

    #[test]
    fn test_tiny_roi_drops_tracking() {
        let set = LandmarkSet::new(vec![Point::new(10.0, 10.0), Point::new(12.0, 11.0)]);
        assert_eq!(Roi::around(&set), None);
        assert_eq!(Roi::around(&LandmarkSet::default()), None);
    }

    #[test]
    fn test_roi_around_detector_box() {
        let face = FaceBox {
            x: 200.0,
            y: 100.0,
            width: 80.0,
            height: 120.0,
            confidence: 0.9,
        };
        // Taller side 120 → 180 square centred on (240, 160).
        let roi = Roi::around_box(&face).unwrap();
        assert!((roi.size - 180.0).abs() < 1e-4);
        assert!((roi.x - 150.0).abs() < 1e-4);
        assert!((roi.y - 70.0).abs() < 1e-4);
        // Centre of the model input lands on the box centre.
        let centre = roi.to_frame(96.0, 96.0);
        assert!((centre.x - 240.0).abs() < 1e-3 && (centre.y - 160.0).abs() < 1e-3);
    }

    #[test]
    fn test_initial_roi() {
        let near = FaceBox {
            x: 100.0,
            y: 100.0,
            width: 100.0,
            height: 100.0,
            confidence: 0.9,
        };
        let far = FaceBox {
            x: 400.0,
            y: 50.0,
            width: 60.0,
            height: 60.0,
            confidence: 0.6,
        };
        // No detector: whole frame.
        assert_eq!(initial_roi(None, 640, 480), Some(Roi::full_frame(640, 480)));
        // Detector found nothing: no face this frame.
        assert_eq!(initial_roi(Some(&[][..]), 640, 480), None);
        // Top box wins.
        let roi = initial_roi(Some(&[near, far][..]), 640, 480).unwrap();
        assert!((roi.size - 150.0).abs() < 1e-4);
        assert!((roi.x - 75.0).abs() < 1e-4);
        // A box too small to track counts as no face.
        let speck = FaceBox { width: 4.0, height: 4.0, ..near };
        assert_eq!(initial_roi(Some(&[speck][..]), 640, 480), None);
    }

    #[test]
    fn test_decode_maps_into_frame() {
        let roi = Roi { x: 100.0, y: 50.0, size: 384.0 };
        let mut raw = vec![0.0f32; MESH_LANDMARKS * MESH_COORDS];
        raw[3] = 96.0; // landmark 1 at the crop centre
        raw[4] = 96.0;
        let set = decode_landmarks(&raw, &roi);
        assert_eq!(set.len(), MESH_LANDMARKS);
        assert_eq!(set.points[0], Point::new(100.0, 50.0));
        assert_eq!(set.points[1], Point::new(292.0, 242.0));
    }

    #[test]
    fn test_discover_output_indices() {
        assert_eq!(discover_output_indices(&[1404, 1]), Some((0, 1)));
        assert_eq!(discover_output_indices(&[1, 1404]), Some((1, 0)));
        assert_eq!(discover_output_indices(&[1, 266, 1404]), Some((2, 0)));
        assert_eq!(discover_output_indices(&[1404, 1404]), None);
        assert_eq!(discover_output_indices(&[100, 1]), None);
    }

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.99);
        assert!(sigmoid(-10.0) < 0.01);
        assert_eq!(sigmoid(f32::NEG_INFINITY), 0.0);
    }

    #[test]
    fn test_preprocess_uniform_frame() {
        let (w, h) = (64, 64);
        let frame = vec![128u8; w * h];
        let roi = Roi { x: 8.0, y: 8.0, size: 48.0 };
        let tensor = preprocess(&frame, w, h, roi, true);
        assert_eq!(tensor.shape(), &[1, 192, 192, 3]);
        let expected = 128.0 / 255.0;
        assert!(tensor.iter().all(|&v| (v - expected).abs() < 1e-4));
    }

    #[test]
    fn test_preprocess_pads_outside_frame() {
        let (w, h) = (64, 32);
        let frame = vec![255u8; w * h];
        let tensor = preprocess(&frame, w, h, Roi::full_frame(w as u32, h as u32), false);
        assert_eq!(tensor.shape(), &[1, 3, 192, 192]);
        // Top rows of the square lie above the frame.
        assert_eq!(tensor[[0, 0, 0, 96]], 0.0);
        // Centre is inside.
        assert!((tensor[[0, 2, 96, 96]] - 1.0).abs() < 1e-4);
    }
}
