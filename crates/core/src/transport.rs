//! Transport capability seams
//!
//! The session manager never talks to a concrete real-time stack. It asks a
//! [`TransportFactory`] for a [`PeerTransport`] per negotiated peer, and the
//! transport hands back media as [`MediaStream`]s and data channels as
//! [`SideChannel`]s. `posecast-webrtc` implements these on webrtc-rs; the
//! integration tests implement them in memory.

use crate::frame::{FrameRecord, VideoFrame};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Default number of frames a relay keeps for slow subscribers
pub const DEFAULT_RELAY_CAPACITY: usize = 16;

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Offer or answer exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }
}

/// Role a peer negotiated as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Sends video, receives nothing
    Camera,
    /// Receives poses over a side channel, optionally raw video
    Monitor,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Camera => write!(f, "camera"),
            PeerRole::Monitor => write!(f, "monitor"),
        }
    }
}

/// A source of timestamped frames that any number of consumers can follow
pub trait MediaStream: Send + Sync {
    /// Stable stream identifier, unique per process
    fn id(&self) -> &str;

    /// Start following the stream from the next published frame
    fn subscribe(&self) -> FrameSubscription;

    /// Whether the producer has finished
    fn is_ended(&self) -> bool;
}

impl fmt::Debug for dyn MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// One consumer's view of a [`MediaStream`]
pub struct FrameSubscription {
    stream_id: String,
    rx: broadcast::Receiver<FrameRecord>,
}

impl FrameSubscription {
    pub fn new(stream_id: impl Into<String>, rx: broadcast::Receiver<FrameRecord>) -> Self {
        Self {
            stream_id: stream_id.into(),
            rx,
        }
    }

    /// Next frame, or `None` once the stream has ended
    ///
    /// A subscriber that falls behind skips the frames it missed.
    pub async fn recv(&mut self) -> Option<FrameRecord> {
        loop {
            match self.rx.recv().await {
                Ok(record) => return Some(record),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(stream = %self.stream_id, skipped, "Subscriber lagged, skipping frames");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }
}

/// In-process relay: one producer publishes, every subscriber gets a copy
pub struct RelayStream {
    id: String,
    tx: Mutex<Option<broadcast::Sender<FrameRecord>>>,
    ended: AtomicBool,
}

impl RelayStream {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Self::with_capacity(id, DEFAULT_RELAY_CAPACITY)
    }

    pub fn with_capacity(id: impl Into<String>, capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            id: id.into(),
            tx: Mutex::new(Some(tx)),
            ended: AtomicBool::new(false),
        })
    }

    /// Publish a frame to current subscribers
    ///
    /// Returns the number of subscribers that received it. Publishing after
    /// [`end`](Self::end) is a no-op.
    pub fn publish(&self, timestamp: f64, frame: Arc<VideoFrame>) -> usize {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(FrameRecord::new(timestamp, frame)).unwrap_or(0),
            None => 0,
        }
    }

    /// Mark the stream ended; subscribers drain what is queued and then see `None`
    pub fn end(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.tx.lock().take();
            debug!(stream = %self.id, "Relay stream ended");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl MediaStream for RelayStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe(&self) -> FrameSubscription {
        let rx = match self.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Already ended: hand out a receiver whose sender is gone
                let (_, rx) = broadcast::channel(1);
                rx
            }
        };
        FrameSubscription::new(self.id.clone(), rx)
    }

    fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// A message-based delivery path to one remote peer
#[async_trait]
pub trait SideChannel: Send + Sync {
    /// Identifier unique across all registered channels
    fn id(&self) -> &str;

    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<()>;
}

/// Called when a remote peer's media track becomes available
///
/// Returns `true` when the track was taken (bound to a slot). A transport
/// need not read media for a track that was refused.
pub type TrackHandler = Box<dyn Fn(Arc<dyn MediaStream>) -> bool + Send + Sync>;

/// Called when a remote peer opens a side channel
pub type ChannelHandler = Box<dyn Fn(Arc<dyn SideChannel>) + Send + Sync>;

/// Called once when the underlying connection fails or closes
pub type ClosedHandler = Box<dyn Fn() + Send + Sync>;

/// One negotiated connection as seen by the session manager
#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn peer_id(&self) -> &str;

    /// Apply the remote offer and produce the local answer
    async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription>;

    fn on_track_received(&self, handler: TrackHandler);

    fn on_channel_opened(&self, handler: ChannelHandler);

    fn on_closed(&self, handler: ClosedHandler);

    /// Register a local stream to forward to the remote peer
    ///
    /// Only records the request; registered streams are attached while
    /// [`create_answer`](Self::create_answer) builds the answer, so this
    /// never waits on the connection. Registering after the answer fails.
    fn add_outbound_stream(&self, stream: Arc<dyn MediaStream>) -> Result<()> {
        Err(Error::Transport(format!(
            "outbound media not supported (stream {})",
            stream.id()
        )))
    }

    /// Close the connection; closing twice is not an error
    async fn close(&self) -> Result<()>;
}

/// Creates one [`PeerTransport`] per negotiation
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, peer_id: &str, role: PeerRole) -> Result<Arc<dyn PeerTransport>>;
}
