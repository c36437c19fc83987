//! Command line and environment configuration

use clap::Parser;
use posecast_core::{PosecastConfig, PreviewConfig};
use posecast_webrtc::WebRtcConfig;

/// Posecast server
///
/// Receives camera video over WebRTC, streams triangulated poses to monitors
/// over data channels and serves an MJPEG preview per camera slot.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// HTTP bind address
    #[arg(long, default_value = "0.0.0.0:8080", env = "POSECAST_BIND")]
    pub bind: String,

    /// Camera image width in pixels
    #[arg(long, default_value_t = 640, env = "POSECAST_IMAGE_WIDTH")]
    pub image_width: u32,

    /// Camera image height in pixels
    #[arg(long, default_value_t = 480, env = "POSECAST_IMAGE_HEIGHT")]
    pub image_height: u32,

    /// Horizontal field of view in degrees
    #[arg(long, default_value_t = 60.0, env = "POSECAST_FOV")]
    pub fov: f64,

    /// Distance between the cameras in meters
    #[arg(long, default_value_t = 0.5, env = "POSECAST_BASELINE")]
    pub baseline: f64,

    /// Maximum capture time difference of a synchronized pair, in seconds
    #[arg(long, default_value_t = 0.05, env = "POSECAST_TOLERANCE")]
    pub tolerance: f64,

    /// Frames retained per camera slot
    #[arg(long, default_value_t = 30, env = "POSECAST_BUFFER")]
    pub buffer_capacity: usize,

    /// Pose cycle rate in Hz
    #[arg(long, default_value_t = 30, env = "POSECAST_FPS")]
    pub fps: u32,

    /// Number of camera slots
    #[arg(long, default_value_t = 2, env = "POSECAST_SLOTS")]
    pub slots: usize,

    /// Drop detections with any landmark less visible than this (0-1)
    #[arg(long, default_value_t = 0.0, env = "POSECAST_MIN_VISIBILITY")]
    pub min_visibility: f32,

    /// Preview frame rate (defaults to the pose rate)
    #[arg(long, env = "POSECAST_PREVIEW_FPS")]
    pub preview_fps: Option<u32>,

    /// Preview JPEG quality (1-100)
    #[arg(long, default_value_t = 80, env = "POSECAST_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Preview downsample factor
    #[arg(long, default_value_t = 1, env = "POSECAST_PREVIEW_SCALE")]
    pub preview_scale: u32,

    /// Serve color previews instead of grayscale
    #[arg(long, env = "POSECAST_COLOR_PREVIEW")]
    pub color_preview: bool,

    /// STUN servers (comma-separated, empty for none)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302",
        env = "POSECAST_STUN_SERVERS"
    )]
    pub stun_servers: Vec<String>,

    /// Data channel label carrying poses ("*" accepts any label)
    #[arg(long, default_value = "pose", env = "POSECAST_POSE_CHANNEL")]
    pub pose_channel: String,

    /// ICE gathering timeout for answers, in milliseconds
    #[arg(long, default_value_t = 2000, env = "POSECAST_ICE_TIMEOUT_MS")]
    pub ice_timeout_ms: u64,

    /// Log as JSON lines
    #[arg(long, env = "POSECAST_LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    pub fn posecast_config(&self) -> PosecastConfig {
        PosecastConfig {
            image_width: self.image_width,
            image_height: self.image_height,
            fov_degrees: self.fov,
            baseline_m: self.baseline,
            sync_tolerance_secs: self.tolerance,
            buffer_capacity: self.buffer_capacity,
            target_fps: self.fps,
            max_camera_slots: self.slots,
            min_visibility: self.min_visibility,
            preview: PreviewConfig {
                fps: self.preview_fps,
                jpeg_quality: self.jpeg_quality,
                scale: self.preview_scale,
                grayscale: !self.color_preview,
            },
        }
    }

    pub fn webrtc_config(&self) -> WebRtcConfig {
        WebRtcConfig {
            stun_servers: self
                .stun_servers
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            pose_channel_label: match self.pose_channel.as_str() {
                "*" => None,
                label => Some(label.to_string()),
            },
            ice_gathering_timeout_ms: self.ice_timeout_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_defaults() {
        let args = Args::try_parse_from(["posecast-server"]).unwrap();
        let config = args.posecast_config();
        let defaults = PosecastConfig::default();

        assert_eq!(config.image_width, defaults.image_width);
        assert_eq!(config.fov_degrees, defaults.fov_degrees);
        assert_eq!(config.sync_tolerance_secs, defaults.sync_tolerance_secs);
        assert_eq!(config.max_camera_slots, defaults.max_camera_slots);
        assert_eq!(config.preview.grayscale, defaults.preview.grayscale);
        assert!(config.validate().is_ok());

        let webrtc = args.webrtc_config();
        assert_eq!(webrtc.pose_channel_label.as_deref(), Some("pose"));
        assert!(webrtc.validate().is_ok());
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "posecast-server",
            "--tolerance",
            "0.02",
            "--slots",
            "3",
            "--color-preview",
            "--min-visibility",
            "0.5",
            "--preview-scale",
            "2",
            "--stun-servers",
            "stun:a.example.com:3478,stun:b.example.com:3478",
            "--pose-channel",
            "*",
        ])
        .unwrap();

        let config = args.posecast_config();
        assert_eq!(config.sync_tolerance_secs, 0.02);
        assert_eq!(config.slot_names(), vec!["cam1", "cam2", "cam3"]);
        assert!(!config.preview.grayscale);
        assert_eq!(config.preview.scale, 2);
        assert_eq!(config.min_visibility, 0.5);

        let webrtc = args.webrtc_config();
        assert_eq!(webrtc.stun_servers.len(), 2);
        assert!(webrtc.pose_channel_label.is_none());
    }

    #[test]
    fn test_empty_stun_list_means_none() {
        let args = Args::try_parse_from(["posecast-server", "--stun-servers", ""]).unwrap();
        assert!(args.webrtc_config().stun_servers.is_empty());
    }
}
