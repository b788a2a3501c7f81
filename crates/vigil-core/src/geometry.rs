//! Eye aspect ratio (EAR) from facial landmark geometry.
//!
//! Each eye is described by six landmark indices in the order
//! `[outer corner, upper 1, upper 2, inner corner, lower 2, lower 1]`:
//!
//! ```text
//!        p1   p2
//!   p0             p3
//!        p5   p4
//! ```
//!
//! `EAR = (|p1 - p5| + |p2 - p4|) / (2 · |p0 - p3|)`, averaged over both eyes.
//! Open eyes sit around 0.3; closed eyes fall towards 0.

use crate::types::{LandmarkSet, Point};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// MediaPipe face mesh indices for the subject's left eye.
pub const LEFT_EYE: [usize; 6] = [33, 160, 158, 133, 153, 144];
/// MediaPipe face mesh indices for the subject's right eye.
pub const RIGHT_EYE: [usize; 6] = [362, 385, 387, 263, 373, 380];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("landmark {index} missing (set has {len} points)")]
    MissingLandmark { index: usize, len: usize },
    #[error("degenerate {eye} eye: corner points coincide")]
    Degenerate { eye: &'static str },
    #[error("non-finite landmark coordinates in {eye} eye")]
    NonFinite { eye: &'static str },
}

/// The two six-point index lists used for EAR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EyeLandmarks {
    pub left: [usize; 6],
    pub right: [usize; 6],
}

impl Default for EyeLandmarks {
    fn default() -> Self {
        Self {
            left: LEFT_EYE,
            right: RIGHT_EYE,
        }
    }
}

impl EyeLandmarks {
    /// Highest landmark index referenced by either eye.
    pub fn max_index(&self) -> usize {
        self.left
            .iter()
            .chain(self.right.iter())
            .copied()
            .max()
            .unwrap_or(0)
    }
}

/// Compute the mean EAR of both eyes.
pub fn eye_aspect_ratio(landmarks: &LandmarkSet, eyes: &EyeLandmarks) -> Result<f32, GeometryError> {
    let left = single_eye_ratio(landmarks, &eyes.left, "left")?;
    let right = single_eye_ratio(landmarks, &eyes.right, "right")?;
    Ok((left + right) / 2.0)
}

fn single_eye_ratio(
    landmarks: &LandmarkSet,
    indices: &[usize; 6],
    eye: &'static str,
) -> Result<f32, GeometryError> {
    let mut p = [Point::default(); 6];
    for (slot, &index) in p.iter_mut().zip(indices.iter()) {
        *slot = *landmarks.get(index).ok_or(GeometryError::MissingLandmark {
            index,
            len: landmarks.len(),
        })?;
    }

    if p.iter().any(|q| !(q.x.is_finite() && q.y.is_finite())) {
        return Err(GeometryError::NonFinite { eye });
    }

    let horizontal = p[0].distance(&p[3]);
    if horizontal <= f32::EPSILON {
        return Err(GeometryError::Degenerate { eye });
    }

    let vertical = p[1].distance(&p[5]) + p[2].distance(&p[4]);
    let ratio = vertical / (2.0 * horizontal);
    if !ratio.is_finite() {
        return Err(GeometryError::NonFinite { eye });
    }
    Ok(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Landmark set where only the indices used by `eyes` are populated.
    fn face_with_eyes(eyes: &EyeLandmarks, left: [Point; 6], right: [Point; 6]) -> LandmarkSet {
        let mut points = vec![Point::default(); eyes.max_index() + 1];
        for (i, &idx) in eyes.left.iter().enumerate() {
            points[idx] = left[i];
        }
        for (i, &idx) in eyes.right.iter().enumerate() {
            points[idx] = right[i];
        }
        LandmarkSet::new(points)
    }

    /// Eye of width 10 whose lids are `open` apart.
    fn eye(x: f32, open: f32) -> [Point; 6] {
        let half = open / 2.0;
        [
            Point::new(x, 0.0),
            Point::new(x + 3.0, -half),
            Point::new(x + 7.0, -half),
            Point::new(x + 10.0, 0.0),
            Point::new(x + 7.0, half),
            Point::new(x + 3.0, half),
        ]
    }

    #[test]
    fn test_open_eyes() {
        let eyes = EyeLandmarks::default();
        let face = face_with_eyes(&eyes, eye(0.0, 3.0), eye(20.0, 3.0));
        // (3 + 3) / (2 * 10)
        let ear = eye_aspect_ratio(&face, &eyes).unwrap();
        assert!((ear - 0.3).abs() < 1e-6, "ear = {ear}");
    }

    #[test]
    fn test_mean_of_both_eyes() {
        let eyes = EyeLandmarks::default();
        let face = face_with_eyes(&eyes, eye(0.0, 4.0), eye(20.0, 0.0));
        // left 0.4, right 0.0
        let ear = eye_aspect_ratio(&face, &eyes).unwrap();
        assert!((ear - 0.2).abs() < 1e-6, "ear = {ear}");
    }

    #[test]
    fn test_degenerate_horizontal_distance() {
        let eyes = EyeLandmarks::default();
        let mut left = eye(0.0, 3.0);
        left[3] = left[0];
        let face = face_with_eyes(&eyes, left, eye(20.0, 3.0));
        assert_eq!(
            eye_aspect_ratio(&face, &eyes),
            Err(GeometryError::Degenerate { eye: "left" })
        );
    }

    #[test]
    fn test_non_finite_landmarks() {
        let eyes = EyeLandmarks::default();
        let nan = [Point::new(f32::NAN, f32::NAN); 6];
        let face = face_with_eyes(&eyes, nan, eye(20.0, 3.0));
        assert_eq!(
            eye_aspect_ratio(&face, &eyes),
            Err(GeometryError::NonFinite { eye: "left" })
        );

        let mut right = eye(20.0, 3.0);
        right[1].y = f32::INFINITY;
        let face = face_with_eyes(&eyes, eye(0.0, 3.0), right);
        assert_eq!(
            eye_aspect_ratio(&face, &eyes),
            Err(GeometryError::NonFinite { eye: "right" })
        );

        // Huge but finite coordinates whose distances overflow.
        let mut left = eye(0.0, 3.0);
        left[1].y = -f32::MAX;
        left[5].y = f32::MAX;
        let face = face_with_eyes(&eyes, left, eye(20.0, 3.0));
        assert_eq!(
            eye_aspect_ratio(&face, &eyes),
            Err(GeometryError::NonFinite { eye: "left" })
        );
    }

    #[test]
    fn test_missing_landmark() {
        let eyes = EyeLandmarks::default();
        let face = LandmarkSet::new(vec![Point::default(); 100]);
        assert_eq!(
            eye_aspect_ratio(&face, &eyes),
            Err(GeometryError::MissingLandmark { index: 160, len: 100 })
        );
    }

    #[test]
    fn test_custom_indices() {
        let eyes = EyeLandmarks {
            left: [0, 1, 2, 3, 4, 5],
            right: [6, 7, 8, 9, 10, 11],
        };
        let mut points = eye(0.0, 2.0).to_vec();
        points.extend(eye(20.0, 2.0));
        let ear = eye_aspect_ratio(&LandmarkSet::new(points), &eyes).unwrap();
        assert!((ear - 0.2).abs() < 1e-6);
        assert_eq!(eyes.max_index(), 11);
    }
}
