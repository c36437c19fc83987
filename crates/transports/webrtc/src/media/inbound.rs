//! Remote camera tracks → relay streams
//!
//! Each inbound video track gets a reader task that reassembles RTP packets
//! into codec frames and publishes them, stamped with a capture time, into a
//! [`RelayStream`] the session manager binds to a camera slot.

use bytes::Bytes;
use posecast_core::{PixelFormat, RelayStream, VideoCodec, VideoFrame};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp::packetizer::Depacketizer;
use webrtc::track::track_remote::TrackRemote;

/// Video RTP clock rate when the negotiated codec does not state one
pub const DEFAULT_VIDEO_CLOCK_RATE: u32 = 90_000;

/// Packets the sample builder waits for a missing one before giving up
const MAX_LATE_PACKETS: u16 = 256;

/// Maps RTP timestamps onto wall-clock seconds
///
/// The first packet anchors the RTP clock to its arrival time; later frames
/// are placed by their RTP offset from it, so inter-frame spacing follows the
/// sender's capture clock while staying comparable across cameras.
#[derive(Debug, Clone)]
pub struct CaptureClock {
    clock_rate: f64,
    anchor: Option<(u32, f64)>,
}

impl CaptureClock {
    pub fn new(clock_rate: u32) -> Self {
        let rate = if clock_rate == 0 {
            DEFAULT_VIDEO_CLOCK_RATE
        } else {
            clock_rate
        };
        Self {
            clock_rate: rate as f64,
            anchor: None,
        }
    }

    /// Capture time in epoch seconds for a frame with this RTP timestamp
    pub fn capture_time(&mut self, rtp_timestamp: u32, arrival: SystemTime) -> f64 {
        let (base_rtp, base_secs) = *self
            .anchor
            .get_or_insert_with(|| (rtp_timestamp, epoch_seconds(arrival)));
        // Signed offset tolerates wraparound and slightly reordered frames
        let offset = rtp_timestamp.wrapping_sub(base_rtp) as i32;
        base_secs + offset as f64 / self.clock_rate
    }
}

fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Spawn the reader for one remote video track
///
/// The relay is ended when the track stops delivering packets or the
/// connection shuts down.
pub(crate) fn spawn_track_reader(
    peer_id: String,
    track: Arc<TrackRemote>,
    relay: Arc<RelayStream>,
    shutdown_rx: broadcast::Receiver<()>,
) -> Option<JoinHandle<()>> {
    let capability = track.codec().capability;
    let Some(codec) = VideoCodec::from_mime_type(&capability.mime_type) else {
        warn!(
            "Peer {} sent unsupported video codec {}, ignoring track",
            peer_id, capability.mime_type
        );
        relay.end();
        return None;
    };
    let clock_rate = capability.clock_rate;

    let handle = tokio::spawn(async move {
        info!("Reading {:?} track for peer {}", codec, peer_id);
        let reader = TrackReader {
            peer_id: &peer_id,
            track: &track,
            relay: &relay,
            codec,
            clock: CaptureClock::new(clock_rate),
        };
        let frames = match codec {
            VideoCodec::Vp8 => reader.run(Vp8Packet::default(), shutdown_rx).await,
            VideoCodec::Vp9 => reader.run(Vp9Packet::default(), shutdown_rx).await,
            VideoCodec::H264 => reader.run(H264Packet::default(), shutdown_rx).await,
        };
        relay.end();
        info!(
            "Track reader ended for peer {} after {} frames",
            peer_id, frames
        );
    });
    Some(handle)
}

struct TrackReader<'a> {
    peer_id: &'a str,
    track: &'a TrackRemote,
    relay: &'a RelayStream,
    codec: VideoCodec,
    clock: CaptureClock,
}

impl TrackReader<'_> {
    /// Pump packets until the track ends; returns the number of frames published
    async fn run<D>(mut self, depacketizer: D, mut shutdown_rx: broadcast::Receiver<()>) -> u64
    where
        D: Depacketizer + Send,
    {
        let clock_rate = self.clock.clock_rate as u32;
        let mut builder = SampleBuilder::new(MAX_LATE_PACKETS, depacketizer, clock_rate);
        let mut published = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("Shutting down track reader for peer {}", self.peer_id);
                    break;
                }

                packet = self.track.read_rtp() => {
                    let (packet, _) = match packet {
                        Ok(packet) => packet,
                        Err(e) => {
                            debug!("RTP read ended for peer {}: {}", self.peer_id, e);
                            break;
                        }
                    };
                    builder.push(packet);

                    while let Some(sample) = builder.pop() {
                        if sample.data.is_empty() {
                            continue;
                        }
                        let timestamp = self.clock.capture_time(sample.packet_timestamp, sample.timestamp);
                        self.publish(timestamp, sample.data);
                        published += 1;
                    }
                }
            }
        }

        published
    }

    fn publish(&self, timestamp: f64, data: Bytes) {
        // Dimensions are unknown until the bitstream is decoded
        let frame = VideoFrame {
            width: 0,
            height: 0,
            format: PixelFormat::Encoded(self.codec),
            data,
        };
        self.relay.publish(timestamp, Arc::new(frame));
    }
}
