//! WebRTC peer connection wrapper
//!
//! Wraps an `RTCPeerConnection` and exposes it to the session manager as a
//! [`PeerTransport`]: camera peers surface their video tracks as relay
//! streams, monitor peers surface their pose data channel.

use crate::channels::DataChannelSink;
use crate::config::WebRtcConfig;
use crate::media::{inbound, outbound};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use posecast_core::transport::{ChannelHandler, ClosedHandler, TrackHandler};
use posecast_core::{
    MediaStream, PeerRole, PeerTransport, RelayStream, SessionDescription, SideChannel,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use webrtc::api::API;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection as WebRTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Callbacks installed by the session manager
#[derive(Default)]
struct Handlers {
    track: Mutex<Option<TrackHandler>>,
    channel: Mutex<Option<ChannelHandler>>,
    closed: Mutex<Option<ClosedHandler>>,
    closed_fired: AtomicBool,
}

impl Handlers {
    /// `true` only when a handler exists and accepted the track
    fn emit_track(&self, stream: Arc<dyn MediaStream>) -> bool {
        self.track
            .lock()
            .as_ref()
            .is_some_and(|handler| handler(stream))
    }

    fn emit_channel(&self, channel: Arc<dyn SideChannel>) -> bool {
        match self.channel.lock().as_ref() {
            Some(handler) => {
                handler(channel);
                true
            }
            None => false,
        }
    }

    /// Fires the closed callback at most once
    fn emit_closed(&self) {
        if self.closed_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handler) = self.closed.lock().as_ref() {
            handler();
        }
    }
}

/// State shared with the webrtc-rs callbacks
struct Shared {
    peer_id: String,
    config: Arc<WebRtcConfig>,
    handlers: Handlers,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Streams to relay, attached when the answer is built
    pending_relays: Mutex<Vec<Arc<dyn MediaStream>>>,
    answered: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

/// One negotiated peer
pub struct PeerConnection {
    role: PeerRole,
    peer_connection: Arc<WebRTCPeerConnection>,
    shared: Arc<Shared>,
}

impl PeerConnection {
    /// Create a peer connection and install its media/channel callbacks
    #[instrument(skip(api, rtc_config, config))]
    pub async fn new(
        api: &API,
        rtc_config: RTCConfiguration,
        peer_id: &str,
        role: PeerRole,
        config: Arc<WebRtcConfig>,
    ) -> Result<Arc<Self>> {
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            peer_id: peer_id.to_string(),
            config,
            handlers: Handlers::default(),
            tasks: Mutex::new(Vec::new()),
            pending_relays: Mutex::new(Vec::new()),
            answered: AtomicBool::new(false),
            shutdown_tx,
            closed: AtomicBool::new(false),
        });

        let connection = Arc::new(Self {
            role,
            peer_connection,
            shared,
        });
        connection.install_callbacks();

        debug!("Created {} peer connection {}", role, peer_id);
        Ok(connection)
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Get the underlying RTCPeerConnection
    pub fn peer_connection(&self) -> &Arc<WebRTCPeerConnection> {
        &self.peer_connection
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn install_callbacks(&self) {
        let shared = Arc::clone(&self.shared);
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let shared = Arc::clone(&shared);
                Box::pin(async move {
                    debug!("Peer {} connection state: {}", shared.peer_id, state);
                    match state {
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            info!("Peer {} connection {}", shared.peer_id, state);
                            shared.handlers.emit_closed();
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!("Peer {} disconnected, waiting for ICE to recover", shared.peer_id);
                        }
                        _ => {}
                    }
                })
            }));

        match self.role {
            PeerRole::Camera => {
                let shared = Arc::clone(&self.shared);
                self.peer_connection
                    .on_track(Box::new(move |track, _receiver, _transceiver| {
                        let shared = Arc::clone(&shared);
                        Box::pin(async move {
                            Self::on_remote_track(&shared, track);
                        })
                    }));
            }
            PeerRole::Monitor => {
                let shared = Arc::clone(&self.shared);
                self.peer_connection
                    .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                        let shared = Arc::clone(&shared);
                        Box::pin(async move {
                            Self::on_remote_channel(&shared, channel);
                        })
                    }));
            }
        }
    }

    fn on_remote_track(shared: &Arc<Shared>, track: Arc<TrackRemote>) {
        if track.kind() != RTPCodecType::Video {
            info!("Ignoring {} track from camera {}", track.kind(), shared.peer_id);
            return;
        }
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }

        let relay = RelayStream::new(format!("{}-{}", shared.peer_id, track.id()));
        info!("Remote video track {} from camera {}", relay.id(), shared.peer_id);

        // Subscribers attach in the handler, before the first frame is read
        if !shared.handlers.emit_track(relay.clone()) {
            info!(
                "Track {} from camera {} not taken, not reading it",
                relay.id(),
                shared.peer_id
            );
            relay.end();
            return;
        }

        if let Some(handle) = inbound::spawn_track_reader(
            shared.peer_id.clone(),
            track,
            relay,
            shared.shutdown_tx.subscribe(),
        ) {
            shared.tasks.lock().push(handle);
        }
    }

    fn on_remote_channel(shared: &Arc<Shared>, channel: Arc<RTCDataChannel>) {
        let label = channel.label().to_string();
        if !shared.config.accepts_channel(&label) {
            info!(
                "Ignoring data channel '{}' from monitor {}",
                label, shared.peer_id
            );
            return;
        }

        let sink = DataChannelSink::new(&shared.peer_id, Arc::clone(&channel));
        let shared = Arc::clone(shared);
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                debug!("Data channel '{}' opened by monitor {}", sink.id(), shared.peer_id);
                if !shared.handlers.emit_channel(sink) {
                    warn!("No channel handler for monitor {}", shared.peer_id);
                }
            })
        }));
    }

    async fn answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let offer = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let relays = {
            let mut pending = self.shared.pending_relays.lock();
            self.shared.answered.store(true, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };
        for stream in relays {
            if let Err(e) = self.attach_relay(stream.as_ref()).await {
                warn!(
                    "Monitor {} answered without relay of {}: {}",
                    self.shared.peer_id,
                    stream.id(),
                    e
                );
            }
        }

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        // Non-trickle signaling: the answer must carry every candidate
        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        let timeout = self.shared.config.ice_gathering_timeout();
        if tokio::time::timeout(timeout, gathering_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "ICE gathering for peer {} incomplete after {:?}, answering with partial candidates",
                self.shared.peer_id, timeout
            );
        }

        let local_desc = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after setting answer".to_string()))?;

        debug!("Created SDP answer for peer {}", self.shared.peer_id);
        Ok(SessionDescription::answer(local_desc.sdp))
    }

    /// Queue a stream to be relayed once the answer is built
    fn add_relay(&self, stream: Arc<dyn MediaStream>) -> Result<()> {
        if self.role != PeerRole::Monitor {
            return Err(Error::MediaTrackError(format!(
                "{} peers do not receive relayed video",
                self.role
            )));
        }

        let mut pending = self.shared.pending_relays.lock();
        if self.shared.answered.load(Ordering::SeqCst) {
            return Err(Error::MediaTrackError(format!(
                "Relay of {} requested after the answer",
                stream.id()
            )));
        }
        pending.push(stream);
        Ok(())
    }

    async fn attach_relay(&self, stream: &dyn MediaStream) -> Result<()> {
        let codec = self.shared.config.relay_codec;
        let track = outbound::relay_track(codec, stream, &self.shared.peer_id);
        let sender = self
            .peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add relay track: {}", e)))?;

        let handle = outbound::spawn_forwarder(
            self.shared.peer_id.clone(),
            codec,
            stream.subscribe(),
            track,
            sender,
            self.shared.shutdown_tx.subscribe(),
        );
        self.shared.tasks.lock().push(handle);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing peer connection for peer {}", self.shared.peer_id);

        // A local close is not reported back as a disconnect
        self.shared.handlers.closed_fired.store(true, Ordering::SeqCst);
        let _ = self.shared.shutdown_tx.send(());

        let result = self.peer_connection.close().await;

        let tasks: Vec<_> = self.shared.tasks.lock().drain(..).collect();
        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                warn!("Media task for peer {} failed: {}", self.shared.peer_id, e);
            }
        }

        result.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to close connection: {}", e))
        })
    }
}

#[async_trait]
impl PeerTransport for PeerConnection {
    fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    async fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> posecast_core::Result<SessionDescription> {
        Ok(self.answer(offer).await?)
    }

    fn on_track_received(&self, handler: TrackHandler) {
        *self.shared.handlers.track.lock() = Some(handler);
    }

    fn on_channel_opened(&self, handler: ChannelHandler) {
        *self.shared.handlers.channel.lock() = Some(handler);
    }

    fn on_closed(&self, handler: ClosedHandler) {
        *self.shared.handlers.closed.lock() = Some(handler);
    }

    fn add_outbound_stream(&self, stream: Arc<dyn MediaStream>) -> posecast_core::Result<()> {
        Ok(self.add_relay(stream)?)
    }

    async fn close(&self) -> posecast_core::Result<()> {
        Ok(self.shutdown().await?)
    }
}
