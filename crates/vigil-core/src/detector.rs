//! SCRFD face detector via ONNX Runtime.
//!
//! Only used to find a face when the mesh has nothing to track. Boxes are
//! decoded from the three stride levels, suppressed with NMS and returned by
//! descending confidence. The keypoint outputs are ignored.

use crate::facemesh::sample_bilinear;
use crate::types::{FaceBox, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Uniform scale plus centring offset from frame pixels to model input pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize) -> Self {
        let side = SCRFD_INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        Self {
            scale,
            pad_x: (side - width as f32 * scale) / 2.0,
            pad_y: (side - height as f32 * scale) / 2.0,
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// (score, bbox) output indices for one stride.
type StrideOutputs = (usize, usize);

pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?output_names, "loaded face detector model");

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {}",
                output_names.len()
            )));
        }

        let stride_outputs = stride_outputs(&output_names);
        tracing::debug!(?stride_outputs, "face detector output mapping");

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Face boxes in `frame`, most confident first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>, DetectorError> {
        let letterbox = Letterbox::fit(frame.width as usize, frame.height as usize);
        let input = preprocess(&frame.data, frame.width as usize, frame.height as usize, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut boxes = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in SCRFD_STRIDES.iter().zip(self.stride_outputs.iter()) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, distances) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            boxes.extend(decode_stride(scores, distances, stride, &letterbox));
        }

        let kept = nms(boxes, SCRFD_NMS_THRESHOLD);
        tracing::trace!(faces = kept.len(), "face detector ran");
        Ok(kept)
    }
}

/// Map strides to outputs by name (`score_8`, `bbox_8`, ...), falling back to
/// the usual positional layout of scores 0..3 then boxes 3..6.
fn stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named {
        Some(pairs) => [pairs[0], pairs[1], pairs[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Letterbox the grayscale frame into a normalised 640×640 NCHW tensor.
fn preprocess(frame: &[u8], width: usize, height: usize, letterbox: &Letterbox) -> Array4<f32> {
    let n = SCRFD_INPUT_SIZE;
    // Padding normalises to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    let content_w = width as f32 * letterbox.scale;
    let content_h = height as f32 * letterbox.scale;

    for y in 0..n {
        let in_y = y as f32 + 0.5 - letterbox.pad_y;
        if in_y < 0.0 || in_y >= content_h {
            continue;
        }
        for x in 0..n {
            let in_x = x as f32 + 0.5 - letterbox.pad_x;
            if in_x < 0.0 || in_x >= content_w {
                continue;
            }
            let src_x = in_x / letterbox.scale - 0.5;
            let src_y = in_y / letterbox.scale - 0.5;
            let v = (sample_edge_clamped(frame, width, height, src_x, src_y) - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }
    tensor
}

/// Bilinear sample with coordinates clamped into the frame, so edge pixels do
/// not bleed towards black inside the letterboxed content.
fn sample_edge_clamped(frame: &[u8], width: usize, height: usize, x: f32, y: f32) -> f32 {
    let x = x.clamp(0.0, (width.saturating_sub(1)) as f32);
    let y = y.clamp(0.0, (height.saturating_sub(1)) as f32);
    sample_bilinear(frame, width, height, x, y)
}

/// Decode one stride level's anchor grid into frame-space boxes above threshold.
fn decode_stride(scores: &[f32], distances: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<FaceBox> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let d = distances.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid) as f32 * step;
            let ay = (cell / grid) as f32 * step;

            let (x0, y0) = letterbox.to_frame(ax - d[0] * step, ay - d[1] * step);
            let (x1, y1) = letterbox.to_frame(ax + d[2] * step, ay + d[3] * step);
            Some(FaceBox {
                x: x0,
                y: y0,
                width: x1 - x0,
                height: y1 - y0,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; result is sorted by descending confidence.
fn nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}
