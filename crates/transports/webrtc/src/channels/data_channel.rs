//! Remote-opened data channel as a pose sink

use async_trait::async_trait;
use posecast_core::SideChannel;
use std::sync::Arc;
use tracing::debug;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// A monitor's data channel, delivering text messages
pub struct DataChannelSink {
    id: String,
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
}

impl DataChannelSink {
    /// Wrap a channel the remote peer opened
    ///
    /// The id combines the peer and the SCTP stream id, so it is unique
    /// across every monitor.
    pub fn new(peer_id: &str, rtc_channel: Arc<RTCDataChannel>) -> Arc<Self> {
        let label = rtc_channel.label().to_string();
        Arc::new(Self {
            id: format!("{}-{}-{}", peer_id, label, rtc_channel.id()),
            label,
            rtc_channel,
        })
    }
}

#[async_trait]
impl SideChannel for DataChannelSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.rtc_channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> posecast_core::Result<()> {
        let state = self.rtc_channel.ready_state();
        if state != RTCDataChannelState::Open {
            return Err(posecast_core::Error::DataChannel(format!(
                "Data channel '{}' is not open (state: {})",
                self.id, state
            )));
        }

        let sent = self
            .rtc_channel
            .send_text(text.to_string())
            .await
            .map_err(|e| {
                posecast_core::Error::DataChannel(format!(
                    "Failed to send on '{}': {}",
                    self.id, e
                ))
            })?;

        debug!("Sent {} bytes on data channel '{}'", sent, self.id);
        Ok(())
    }
}
