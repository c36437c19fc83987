//! Configuration types for the posecast engine

use serde::{Deserialize, Serialize};

/// Main configuration, fixed for the lifetime of the process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PosecastConfig {
    /// Camera image width in pixels (default: 640)
    pub image_width: u32,

    /// Camera image height in pixels (default: 480)
    pub image_height: u32,

    /// Horizontal field of view in degrees (default: 60)
    pub fov_degrees: f64,

    /// Distance between the two cameras along x, in meters (default: 0.5)
    pub baseline_m: f64,

    /// Maximum capture timestamp difference for a synchronized pair, in seconds (default: 0.05)
    pub sync_tolerance_secs: f64,

    /// Frame records retained per slot (default: 30)
    pub buffer_capacity: usize,

    /// Pose cycle rate in Hz (default: 30)
    pub target_fps: u32,

    /// Number of camera slots (`cam1` .. `camN`, default: 2)
    pub max_camera_slots: usize,

    /// Detections with any landmark visibility below this are dropped, 0-1 (default: 0)
    pub min_visibility: f32,

    /// Preview stream options
    pub preview: PreviewConfig,
}

/// Preview (MJPEG) stream options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Preview frame rate; `None` follows `target_fps`
    pub fps: Option<u32>,

    /// JPEG quality 1-100 (default: 80)
    pub jpeg_quality: u8,

    /// Integer downsample factor, 1 = full resolution (default: 1)
    pub scale: u32,

    /// Serve grayscale previews (default: true)
    pub grayscale: bool,
}

impl Default for PosecastConfig {
    fn default() -> Self {
        Self {
            image_width: 640,
            image_height: 480,
            fov_degrees: 60.0,
            baseline_m: 0.5,
            sync_tolerance_secs: 0.05,
            buffer_capacity: 30,
            target_fps: 30,
            max_camera_slots: 2,
            min_visibility: 0.0,
            preview: PreviewConfig::default(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            fps: None,
            jpeg_quality: 80,
            scale: 1,
            grayscale: true,
        }
    }
}

impl PosecastConfig {
    /// Maximum number of camera slots accepted by [`validate`](Self::validate)
    pub const MAX_SLOTS: usize = 16;

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - image dimensions are zero
    /// - `fov_degrees` is not in (0, 180)
    /// - `baseline_m` is not positive
    /// - `sync_tolerance_secs` is negative or not finite
    /// - `buffer_capacity` is zero
    /// - `target_fps` (or the preview fps) is not in range 1-240
    /// - `max_camera_slots` is not in range 1-16
    /// - `min_visibility` is not in range 0-1
    /// - preview quality or scale is out of range
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.image_width == 0 || self.image_height == 0 {
            return Err(Error::InvalidConfig(format!(
                "image dimensions must be non-zero, got {}x{}",
                self.image_width, self.image_height
            )));
        }

        if !(self.fov_degrees > 0.0 && self.fov_degrees < 180.0) {
            return Err(Error::InvalidConfig(format!(
                "fov_degrees must be in range (0, 180), got {}",
                self.fov_degrees
            )));
        }

        if !(self.baseline_m.is_finite() && self.baseline_m > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "baseline_m must be positive, got {}",
                self.baseline_m
            )));
        }

        if !(self.sync_tolerance_secs.is_finite() && self.sync_tolerance_secs >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "sync_tolerance_secs must be a non-negative number, got {}",
                self.sync_tolerance_secs
            )));
        }

        if self.buffer_capacity == 0 {
            return Err(Error::InvalidConfig(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.min_visibility) {
            return Err(Error::InvalidConfig(format!(
                "min_visibility must be in range 0-1, got {}",
                self.min_visibility
            )));
        }

        check_fps("target_fps", self.target_fps)?;
        if let Some(fps) = self.preview.fps {
            check_fps("preview.fps", fps)?;
        }

        if self.max_camera_slots == 0 || self.max_camera_slots > Self::MAX_SLOTS {
            return Err(Error::InvalidConfig(format!(
                "max_camera_slots must be in range 1-{}, got {}",
                Self::MAX_SLOTS,
                self.max_camera_slots
            )));
        }

        if self.preview.jpeg_quality == 0 || self.preview.jpeg_quality > 100 {
            return Err(Error::InvalidConfig(format!(
                "preview.jpeg_quality must be in range 1-100, got {}",
                self.preview.jpeg_quality
            )));
        }

        if self.preview.scale == 0 {
            return Err(Error::InvalidConfig(
                "preview.scale must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Slot names in declared order: `cam1`, `cam2`, ...
    pub fn slot_names(&self) -> Vec<String> {
        (1..=self.max_camera_slots).map(|i| format!("cam{}", i)).collect()
    }

    /// Pose cycle period
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / self.target_fps.max(1) as f64)
    }

    /// Preview cadence period
    pub fn preview_interval(&self) -> std::time::Duration {
        let fps = self.preview.fps.unwrap_or(self.target_fps).max(1);
        std::time::Duration::from_secs_f64(1.0 / fps as f64)
    }
}

fn check_fps(name: &str, fps: u32) -> crate::Result<()> {
    if fps == 0 || fps > 240 {
        return Err(crate::Error::InvalidConfig(format!(
            "{} must be in range 1-240, got {}",
            name, fps
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PosecastConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slot_names(), vec!["cam1", "cam2"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases: [fn(&mut PosecastConfig); 11] = [
            |c| c.image_width = 0,
            |c| c.fov_degrees = 180.0,
            |c| c.baseline_m = 0.0,
            |c| c.sync_tolerance_secs = f64::NAN,
            |c| c.buffer_capacity = 0,
            |c| c.target_fps = 0,
            |c| c.max_camera_slots = 17,
            |c| c.min_visibility = 1.5,
            |c| c.preview.jpeg_quality = 0,
            |c| c.preview.scale = 0,
            |c| c.preview.fps = Some(1000),
        ];

        for mutate in cases {
            let mut config = PosecastConfig::default();
            mutate(&mut config);
            let err = config.validate().unwrap_err();
            assert!(err.is_config_error(), "unexpected error: {}", err);
        }
    }

    #[test]
    fn test_intervals() {
        let mut config = PosecastConfig::default();
        config.target_fps = 20;
        assert_eq!(config.frame_interval().as_millis(), 50);
        assert_eq!(config.preview_interval().as_millis(), 50);

        config.preview.fps = Some(10);
        assert_eq!(config.preview_interval().as_millis(), 100);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PosecastConfig =
            serde_json::from_str(r#"{"baseline_m": 0.3, "preview": {"scale": 2}}"#).unwrap();
        assert_eq!(config.baseline_m, 0.3);
        assert_eq!(config.preview.scale, 2);
        assert_eq!(config.preview.jpeg_quality, 80);
        assert_eq!(config.buffer_capacity, 30);
    }
}
