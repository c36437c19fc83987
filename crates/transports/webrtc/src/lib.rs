//! WebRTC transport for posecast
//!
//! Implements the `posecast_core` transport capability on webrtc-rs:
//!
//! - camera peers: remote video tracks are read packet by packet, reassembled
//!   into codec frames and published as relay streams stamped with capture time
//! - monitor peers: the remote-opened `pose` data channel becomes a pose sink,
//!   and bound camera streams can be relayed back as outbound video tracks
//!
//! Signaling is plain offer/answer over HTTP (non-trickle ICE), so answers
//! wait for candidate gathering before they are returned.

pub mod channels;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;

pub use channels::DataChannelSink;
pub use config::{TurnServerConfig, WebRtcConfig, DEFAULT_POSE_CHANNEL_LABEL};
pub use error::{Error, Result};
pub use peer::{PeerConnection, WebRtcTransportFactory};
