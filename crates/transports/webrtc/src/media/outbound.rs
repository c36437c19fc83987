//! Camera relay → monitor video track
//!
//! Monitors may receive the raw camera video next to the pose channel. Frames
//! are forwarded without transcoding, so only frames already encoded with the
//! outbound track's codec are written; anything else is skipped.

use posecast_core::{FrameSubscription, MediaStream, PixelFormat, VideoCodec};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Duration used when consecutive timestamps give no usable spacing
const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Build the local track that carries one relayed camera stream
pub(crate) fn relay_track(
    codec: VideoCodec,
    stream: &dyn MediaStream,
    peer_id: &str,
) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: codec.mime_type().to_string(),
            clock_rate: 90_000,
            ..Default::default()
        },
        format!("relay-{}", stream.id()),
        format!("posecast-{}", peer_id),
    ))
}

/// Spawn the task forwarding a subscription into a local track
///
/// Also drains RTCP from the sender so interceptors keep running.
pub(crate) fn spawn_forwarder(
    peer_id: String,
    codec: VideoCodec,
    mut subscription: FrameSubscription,
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream_id = subscription.stream_id().to_string();
        info!("Relaying stream {} to monitor {}", stream_id, peer_id);

        let mut rtcp_buf = vec![0u8; 1500];
        let mut last_timestamp: Option<f64> = None;
        let mut skipped = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    debug!("Shutting down relay of {} for peer {}", stream_id, peer_id);
                    break;
                }

                rtcp = sender.read(&mut rtcp_buf) => {
                    if rtcp.is_err() {
                        debug!("RTCP reader closed for relay of {} to peer {}", stream_id, peer_id);
                        break;
                    }
                }

                record = subscription.recv() => {
                    let Some(record) = record else {
                        info!("Relayed stream {} ended for peer {}", stream_id, peer_id);
                        break;
                    };

                    if record.frame.format != PixelFormat::Encoded(codec) {
                        skipped += 1;
                        if skipped == 1 {
                            debug!(
                                "Stream {} carries {:?}, monitor {} expects {:?}; skipping frames",
                                stream_id, record.frame.format, peer_id, codec
                            );
                        }
                        continue;
                    }

                    let duration = frame_duration(last_timestamp, record.timestamp);
                    last_timestamp = Some(record.timestamp);

                    let sample = Sample {
                        data: record.frame.data.clone(),
                        duration,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        warn!("Failed to relay frame of {} to peer {}: {}", stream_id, peer_id, e);
                        break;
                    }
                }
            }
        }
    })
}

/// Spacing between two capture timestamps, falling back to ~30 fps
fn frame_duration(previous: Option<f64>, current: f64) -> Duration {
    match previous {
        Some(prev) if current > prev && current - prev < 1.0 => {
            Duration::from_secs_f64(current - prev)
        }
        _ => DEFAULT_FRAME_DURATION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use posecast_core::RelayStream;
    use webrtc::track::track_local::TrackLocal;

    #[test]
    fn test_frame_duration_follows_timestamps() {
        assert_eq!(frame_duration(None, 1.0), DEFAULT_FRAME_DURATION);
        assert_eq!(
            frame_duration(Some(1.0), 1.05),
            Duration::from_secs_f64(1.05 - 1.0)
        );
        // Gaps and reordering fall back
        assert_eq!(frame_duration(Some(1.0), 3.0), DEFAULT_FRAME_DURATION);
        assert_eq!(frame_duration(Some(2.0), 1.0), DEFAULT_FRAME_DURATION);
    }

    #[test]
    fn test_relay_track_identity() {
        let relay = RelayStream::new("cam-a-video");
        let track = relay_track(VideoCodec::Vp8, relay.as_ref(), "monitor-1");

        assert_eq!(track.id(), "relay-cam-a-video");
        assert_eq!(track.stream_id(), "posecast-monitor-1");
        assert_eq!(track.codec().mime_type, "video/VP8");
    }
}
