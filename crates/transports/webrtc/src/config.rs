//! Configuration types for the WebRTC transport

use posecast_core::VideoCodec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Label monitors use for the pose data channel
pub const DEFAULT_POSE_CHANNEL_LABEL: &str = "pose";

/// Main configuration for the WebRTC transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs; empty means host candidates only
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Data channel label accepted for pose delivery; `None` accepts any label
    pub pose_channel_label: Option<String>,

    /// How long an answer waits for ICE candidate gathering, in milliseconds (default: 2000)
    pub ice_gathering_timeout_ms: u64,

    /// Codec of the camera video relayed to monitors (default: VP8)
    pub relay_codec: VideoCodec,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            pose_channel_label: Some(DEFAULT_POSE_CHANNEL_LABEL.to_string()),
            ice_gathering_timeout_ms: 2000,
            relay_codec: VideoCodec::Vp8,
        }
    }
}

impl WebRtcConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - a STUN URL does not start with `stun:` or `stuns:`
    /// - a TURN URL does not start with `turn:` or `turns:`
    /// - `ice_gathering_timeout_ms` is not in range 1-60000
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if self.ice_gathering_timeout_ms == 0 || self.ice_gathering_timeout_ms > 60_000 {
            return Err(Error::InvalidConfig(format!(
                "ice_gathering_timeout_ms must be in range 1-60000, got {}",
                self.ice_gathering_timeout_ms
            )));
        }

        if matches!(&self.pose_channel_label, Some(label) if label.is_empty()) {
            return Err(Error::InvalidConfig(
                "pose_channel_label must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    /// Whether a remote-opened channel with this label carries poses
    pub fn accepts_channel(&self, label: &str) -> bool {
        match &self.pose_channel_label {
            Some(expected) => expected == label,
            None => true,
        }
    }
}
