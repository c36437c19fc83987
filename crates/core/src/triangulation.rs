//! Stereo triangulation
//!
//! Two pinhole cameras with identical intrinsics, the second displaced by the
//! configured baseline along +x. Landmarks arrive in normalized image
//! coordinates and are triangulated with the linear (DLT) method.

use crate::config::PosecastConfig;
use crate::frame::Point3;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// Homogeneous scale below which a solution is treated as a point at infinity
const MIN_HOMOGENEOUS_W: f64 = 1e-9;

/// Pinhole intrinsics with square pixels and a centered principal point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraIntrinsics {
    pub focal_length: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    /// Derive intrinsics from a horizontal field of view
    pub fn from_fov(fov_degrees: f64, width: u32, height: u32) -> Self {
        let w = width as f64;
        let h = height as f64;
        let focal_length = (w / 2.0) / (fov_degrees.to_radians() / 2.0).tan();
        Self {
            focal_length,
            cx: w / 2.0,
            cy: h / 2.0,
            width,
            height,
        }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.focal_length,
            0.0,
            self.cx,
            0.0,
            self.focal_length,
            self.cy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Normalized `[0, 1]` coordinates to pixels
    pub fn to_pixels(&self, x: f64, y: f64) -> (f64, f64) {
        (x * self.width as f64, y * self.height as f64)
    }
}

/// Calibration summary sent to monitors on connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub image_width: u32,
    pub image_height: u32,
    pub fov_degrees: f64,
    pub focal_length: f64,
    pub principal_point: [f64; 2],
    pub baseline_m: f64,
}

/// Fixed two-camera rig
#[derive(Debug, Clone)]
pub struct StereoRig {
    intrinsics: CameraIntrinsics,
    fov_degrees: f64,
    baseline: f64,
    left: Matrix3x4<f64>,
    right: Matrix3x4<f64>,
}

impl StereoRig {
    pub fn new(intrinsics: CameraIntrinsics, fov_degrees: f64, baseline: f64) -> Self {
        let k = intrinsics.matrix();
        let left = k * extrinsics(Vector3::zeros());
        let right = k * extrinsics(Vector3::new(baseline, 0.0, 0.0));
        Self {
            intrinsics,
            fov_degrees,
            baseline,
            left,
            right,
        }
    }

    pub fn from_config(config: &PosecastConfig) -> Self {
        let intrinsics =
            CameraIntrinsics::from_fov(config.fov_degrees, config.image_width, config.image_height);
        Self::new(intrinsics, config.fov_degrees, config.baseline_m)
    }

    pub fn intrinsics(&self) -> &CameraIntrinsics {
        &self.intrinsics
    }

    pub fn calibration(&self) -> Calibration {
        Calibration {
            image_width: self.intrinsics.width,
            image_height: self.intrinsics.height,
            fov_degrees: self.fov_degrees,
            focal_length: self.intrinsics.focal_length,
            principal_point: [self.intrinsics.cx, self.intrinsics.cy],
            baseline_m: self.baseline,
        }
    }

    /// Triangulate landmark pairs given in normalized coordinates
    ///
    /// Returns `None` when the sets are empty or differ in length. A landmark
    /// whose solution lies at infinity (zero disparity) falls back to its
    /// degraded left-view value.
    pub fn triangulate(&self, left: &[Point3], right: &[Point3]) -> Option<Vec<Point3>> {
        if left.is_empty() || left.len() != right.len() {
            return None;
        }

        let points = left
            .iter()
            .zip(right)
            .map(|(l, r)| {
                let pl = self.intrinsics.to_pixels(l[0] as f64, l[1] as f64);
                let pr = self.intrinsics.to_pixels(r[0] as f64, r[1] as f64);
                self.triangulate_pixels(pl, pr)
                    .unwrap_or([l[0], l[1], 0.0])
            })
            .collect();

        Some(points)
    }

    /// Triangulate one pixel correspondence, `None` when degenerate
    pub fn triangulate_pixels(&self, left: (f64, f64), right: (f64, f64)) -> Option<Point3> {
        let mut ata = Matrix4::zeros();
        for (p, (u, v)) in [(&self.left, left), (&self.right, right)] {
            let row1 = Vector4::new(
                u * p[(2, 0)] - p[(0, 0)],
                u * p[(2, 1)] - p[(0, 1)],
                u * p[(2, 2)] - p[(0, 2)],
                u * p[(2, 3)] - p[(0, 3)],
            );
            let row2 = Vector4::new(
                v * p[(2, 0)] - p[(1, 0)],
                v * p[(2, 1)] - p[(1, 1)],
                v * p[(2, 2)] - p[(1, 2)],
                v * p[(2, 3)] - p[(1, 3)],
            );
            ata += row1 * row1.transpose();
            ata += row2 * row2.transpose();
        }

        // Solution is the eigenvector of AᵀA with the smallest eigenvalue
        let eigen = ata.symmetric_eigen();
        let min_idx = eigen
            .eigenvalues
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i)?;
        let x = eigen.eigenvectors.column(min_idx);

        let w = x[3];
        if !w.is_finite() || w.abs() < MIN_HOMOGENEOUS_W {
            return None;
        }

        let point = [(x[0] / w) as f32, (x[1] / w) as f32, (x[2] / w) as f32];
        point.iter().all(|c| c.is_finite()).then_some(point)
    }

    /// Project a camera-frame point into both views, in pixels
    pub fn project(&self, point: [f64; 3]) -> ((f64, f64), (f64, f64)) {
        let hom = Vector4::new(point[0], point[1], point[2], 1.0);
        let proj = |p: &Matrix3x4<f64>| {
            let uvw = p * hom;
            (uvw[0] / uvw[2], uvw[1] / uvw[2])
        };
        (proj(&self.left), proj(&self.right))
    }
}

/// `[I | -c]` for a camera centered at `c` with no rotation
fn extrinsics(center: Vector3<f64>) -> Matrix3x4<f64> {
    let mut rt = Matrix3x4::zeros();
    for i in 0..3 {
        rt[(i, i)] = 1.0;
        rt[(i, 3)] = -center[i];
    }
    rt
}

/// Single-view fallback: keep `(x, y)`, zero the third coordinate
pub fn degrade(landmarks: &[Point3]) -> Vec<Point3> {
    landmarks.iter().map(|p| [p[0], p[1], 0.0]).collect()
}
