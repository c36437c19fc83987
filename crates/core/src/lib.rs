//! Posecast core engine
//!
//! Ingests live video from several cameras, keeps the camera slots time
//! synchronized, triangulates a skeletal pose per synchronized frame pair and
//! fans the pose out to monitor side channels. Also serves a best-effort
//! JPEG preview per camera slot.
//!
//! The crate is transport-agnostic: real-time media and data channels come in
//! through the traits in [`transport`], and landmark detection through
//! [`pose::LandmarkDetector`].
//!
//! # Layout
//!
//! - [`buffer`]: bounded per-slot frame buffers and pair matching
//! - [`slots`]: slot-to-stream assignment and ingestion tasks
//! - [`pose`]: landmark detector adapter
//! - [`triangulation`]: stereo rig and DLT triangulation
//! - [`pipeline`]: fixed-rate pose cycle
//! - [`broadcast`]: pose fan-out to side channels
//! - [`preview`]: MJPEG preview streams
//! - [`session`]: the coordinator tying everything together

pub mod broadcast;
pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod pose;
pub mod preview;
pub mod session;
pub mod slots;
pub mod transport;
pub mod triangulation;

pub use broadcast::{BroadcastHub, BroadcastStats, PoseMode, PoseResult, ServerMessage};
pub use buffer::{FrameBuffer, FrameStore};
pub use config::{PosecastConfig, PreviewConfig};
pub use error::{Error, Result};
pub use frame::{FrameRecord, PixelFormat, Point3, VideoCodec, VideoFrame};
pub use pipeline::{PipelineStats, PosePipeline};
pub use pose::{LandmarkDetector, NullDetector, PoseEstimator, RawLandmark};
pub use preview::{PreviewEncoder, PreviewStreamer};
pub use session::{
    NegotiatedSession, PeerSession, ServerStatus, SessionInfo, SessionManager, SessionState,
};
pub use slots::{Assignment, SlotHandle, SlotPool, SlotStatus};
pub use transport::{
    FrameSubscription, MediaStream, PeerRole, PeerTransport, RelayStream, SdpType,
    SessionDescription, SideChannel, TransportFactory,
};
pub use triangulation::{Calibration, CameraIntrinsics, StereoRig};

/// Library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
