//! Pose estimation adapter
//!
//! Landmark detection itself is an external capability behind
//! [`LandmarkDetector`]. [`PoseEstimator`] normalizes whatever the detector
//! returns into plain [`Point3`] sequences.

use crate::frame::{Point3, VideoFrame};
use std::sync::Arc;
use tracing::debug;

/// A landmark in the detector's own shape
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawLandmark {
    /// Normalized horizontal image coordinate
    pub x: f32,
    /// Normalized vertical image coordinate
    pub y: f32,
    /// Relative depth, if the detector provides one
    pub z: Option<f32>,
    /// Confidence that the landmark is visible, 0-1
    pub visibility: Option<f32>,
}

impl RawLandmark {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ..Default::default()
        }
    }
}

/// Body landmark detector
///
/// Returning an empty list means nothing was found. Implementations are
/// called from the blocking thread pool.
pub trait LandmarkDetector: Send + Sync {
    fn detect(&self, frame: &VideoFrame) -> anyhow::Result<Vec<RawLandmark>>;

    fn name(&self) -> &str {
        "detector"
    }
}

/// Detector that never finds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl LandmarkDetector for NullDetector {
    fn detect(&self, _frame: &VideoFrame) -> anyhow::Result<Vec<RawLandmark>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Stateless adapter from frames to normalized landmarks
#[derive(Clone)]
pub struct PoseEstimator {
    detector: Arc<dyn LandmarkDetector>,
    min_visibility: f32,
}

impl PoseEstimator {
    pub fn new(detector: Arc<dyn LandmarkDetector>) -> Self {
        Self {
            detector,
            min_visibility: 0.0,
        }
    }

    /// Treat the detection as failed when any landmark is less visible than this
    pub fn with_min_visibility(mut self, min_visibility: f32) -> Self {
        self.min_visibility = min_visibility;
        self
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Detect landmarks; `None` when nothing usable was found
    pub fn detect(&self, frame: &VideoFrame) -> Option<Vec<Point3>> {
        let raw = match self.detector.detect(frame) {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Detector {} failed: {}", self.detector.name(), e);
                return None;
            }
        };

        if raw.is_empty() {
            return None;
        }

        if raw
            .iter()
            .any(|lm| lm.visibility.is_some_and(|v| v < self.min_visibility))
        {
            debug!("Discarding detection below visibility {}", self.min_visibility);
            return None;
        }

        Some(raw.iter().map(normalize).collect())
    }
}

fn normalize(lm: &RawLandmark) -> Point3 {
    [finite(lm.x), finite(lm.y), lm.z.map(finite).unwrap_or(0.0)]
}

fn finite(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(anyhow::Result<Vec<RawLandmark>>);

    impl LandmarkDetector for Fixed {
        fn detect(&self, _frame: &VideoFrame) -> anyhow::Result<Vec<RawLandmark>> {
            match &self.0 {
                Ok(v) => Ok(v.clone()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    fn estimate(result: anyhow::Result<Vec<RawLandmark>>) -> Option<Vec<Point3>> {
        PoseEstimator::new(Arc::new(Fixed(result))).detect(&VideoFrame::black(2, 2))
    }

    #[test]
    fn test_landmarks_normalized() {
        let points = estimate(Ok(vec![
            RawLandmark::new(0.5, 0.25),
            RawLandmark {
                x: f32::NAN,
                y: 0.1,
                z: Some(-0.2),
                visibility: Some(0.9),
            },
        ]))
        .unwrap();

        assert_eq!(points, vec![[0.5, 0.25, 0.0], [0.0, 0.1, -0.2]]);
    }

    #[test]
    fn test_no_landmarks_is_none() {
        assert!(estimate(Ok(Vec::new())).is_none());
        assert!(estimate(Err(anyhow::anyhow!("model not loaded"))).is_none());
        assert!(PoseEstimator::new(Arc::new(NullDetector))
            .detect(&VideoFrame::black(2, 2))
            .is_none());
    }

    #[test]
    fn test_min_visibility() {
        let detector = Arc::new(Fixed(Ok(vec![RawLandmark {
            visibility: Some(0.3),
            ..RawLandmark::new(0.5, 0.5)
        }])));
        let estimator = PoseEstimator::new(detector).with_min_visibility(0.5);
        assert!(estimator.detect(&VideoFrame::black(2, 2)).is_none());
    }
}
