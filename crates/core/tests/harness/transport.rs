//! In-memory transport for driving the session manager without a network

use async_trait::async_trait;
use parking_lot::Mutex;
use posecast_core::transport::{
    ChannelHandler, ClosedHandler, MediaStream, PeerRole, PeerTransport, SessionDescription,
    SideChannel, TrackHandler, TransportFactory,
};
use posecast_core::{Error, Result, ServerMessage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Offers containing this marker fail negotiation
pub const MALFORMED_SDP: &str = "malformed";

/// Side channel that records everything sent to it
pub struct MockSideChannel {
    id: String,
    open: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockSideChannel {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Simulate the remote end closing the channel
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Make every further send fail while the channel still reports open
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .iter()
            .map(|text| serde_json::from_str(text).expect("server sent invalid JSON"))
            .collect()
    }

    /// Points of every `pose3d` message received so far
    pub fn poses(&self) -> Vec<Vec<[f32; 3]>> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Pose3d { points } => Some(points),
                _ => None,
            })
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl SideChannel for MockSideChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn label(&self) -> &str {
        "pose"
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() || self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::DataChannel(format!("channel {} unavailable", self.id)));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}

/// Transport whose media and channel events are raised by the test
pub struct MockTransport {
    peer_id: String,
    role: PeerRole,
    supports_outbound: bool,
    on_track: Mutex<Option<TrackHandler>>,
    on_channel: Mutex<Option<ChannelHandler>>,
    on_closed: Mutex<Option<ClosedHandler>>,
    outbound: Mutex<Vec<String>>,
    outbound_at_answer: Mutex<Option<usize>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockTransport {
    fn new(peer_id: &str, role: PeerRole, supports_outbound: bool) -> Arc<Self> {
        Arc::new(Self {
            peer_id: peer_id.to_string(),
            role,
            supports_outbound,
            on_track: Mutex::new(None),
            on_channel: Mutex::new(None),
            on_closed: Mutex::new(None),
            outbound: Mutex::new(Vec::new()),
            outbound_at_answer: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Deliver a remote media track; `true` when the manager took it
    pub fn emit_track(&self, stream: Arc<dyn MediaStream>) -> bool {
        self.on_track
            .lock()
            .as_ref()
            .is_some_and(|handler| handler(stream))
    }

    /// Deliver a remote-opened side channel
    pub fn open_channel(&self, channel: Arc<dyn SideChannel>) {
        if let Some(handler) = self.on_channel.lock().as_ref() {
            handler(channel);
        }
    }

    /// Simulate the connection dropping
    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handler) = self.on_closed.lock().as_ref() {
            handler();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Ids of streams forwarded to this peer
    pub fn outbound(&self) -> Vec<String> {
        self.outbound.lock().clone()
    }

    /// Streams already registered when the answer was created
    pub fn outbound_at_answer(&self) -> Option<usize> {
        *self.outbound_at_answer.lock()
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.sdp.contains(MALFORMED_SDP) {
            return Err(Error::Negotiation("could not parse offer".to_string()));
        }
        *self.outbound_at_answer.lock() = Some(self.outbound.lock().len());
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns={}\r\n",
            self.peer_id
        )))
    }

    fn on_track_received(&self, handler: TrackHandler) {
        *self.on_track.lock() = Some(handler);
    }

    fn on_channel_opened(&self, handler: ChannelHandler) {
        *self.on_channel.lock() = Some(handler);
    }

    fn on_closed(&self, handler: ClosedHandler) {
        *self.on_closed.lock() = Some(handler);
    }

    fn add_outbound_stream(&self, stream: Arc<dyn MediaStream>) -> Result<()> {
        if self.outbound_at_answer.lock().is_some() {
            return Err(Error::Transport("already answered".to_string()));
        }
        if !self.supports_outbound {
            return Err(Error::Transport("outbound media not supported".to_string()));
        }
        self.outbound.lock().push(stream.id().to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory that keeps every transport it creates for later inspection
#[derive(Default)]
pub struct MockTransportFactory {
    supports_outbound: bool,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_outbound() -> Arc<Self> {
        Arc::new(Self {
            supports_outbound: true,
            ..Default::default()
        })
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .find(|t| t.peer_id == peer_id)
            .cloned()
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self, peer_id: &str, role: PeerRole) -> Result<Arc<dyn PeerTransport>> {
        let transport = MockTransport::new(peer_id, role, self.supports_outbound);
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}
