//! Session lifecycle manager
//!
//! [`SessionManager`] is the long-lived coordinator. It owns the slot pool,
//! frame buffers, sink registry, pose cycle and preview streamer, negotiates
//! camera and monitor peers through a [`TransportFactory`], and tears
//! everything down on [`shutdown`](SessionManager::shutdown).

use crate::broadcast::BroadcastHub;
use crate::buffer::FrameStore;
use crate::config::PosecastConfig;
use crate::pipeline::{PipelineStats, PosePipeline};
use crate::pose::{LandmarkDetector, PoseEstimator};
use crate::preview::PreviewStreamer;
use crate::slots::{Assignment, SlotPool, SlotStatus};
use crate::transport::{
    MediaStream, PeerRole, PeerTransport, SdpType, SessionDescription, SideChannel,
    TransportFactory,
};
use crate::triangulation::StereoRig;
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

/// Negotiation state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Negotiating,
    Connected,
    Closing,
    Closed,
}

/// One negotiated connection
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub id: String,
    pub role: PeerRole,
    pub state: SessionState,
    /// Ids of media streams received from this peer
    pub tracks: BTreeSet<String>,
    /// Ids of side channels opened by this peer
    pub channels: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl PeerSession {
    pub fn new(id: impl Into<String>, role: PeerRole) -> Self {
        Self {
            id: id.into(),
            role,
            state: SessionState::Negotiating,
            tracks: BTreeSet::new(),
            channels: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Move to `next`; nothing leaves `Closed`
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if self.state == SessionState::Closed && next != SessionState::Closed {
            return Err(Error::SessionClosed(self.id.clone()));
        }
        debug!("Session {} {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Whether tracks and channels may still be attached
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::Negotiating | SessionState::Connected
        )
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            role: self.role,
            state: self.state,
            tracks: self.tracks.iter().cloned().collect(),
            channels: self.channels.iter().cloned().collect(),
            created_at: self.created_at,
        }
    }
}

/// Serializable session snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub role: PeerRole,
    pub state: SessionState,
    pub tracks: Vec<String>,
    pub channels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful negotiation
#[derive(Debug, Clone, Serialize)]
pub struct NegotiatedSession {
    pub session_id: String,
    #[serde(flatten)]
    pub answer: SessionDescription,
}

/// Session counts by role
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionCounts {
    pub camera: usize,
    pub monitor: usize,
}

/// Coordinator status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub slots: Vec<SlotStatus>,
    pub sessions: SessionCounts,
    pub sinks: usize,
    pub preview_viewers: usize,
    pub ingestion_tasks: usize,
    pub pipeline: PipelineStats,
    pub shutting_down: bool,
}

struct SessionEntry {
    session: Mutex<PeerSession>,
    transport: Arc<dyn PeerTransport>,
}

/// Long-lived coordinator for sessions, slots and pose delivery
pub struct SessionManager {
    factory: Arc<dyn TransportFactory>,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    slots: Arc<SlotPool>,
    store: Arc<FrameStore>,
    hub: Arc<BroadcastHub>,
    rig: Arc<StereoRig>,
    pipeline: Arc<PosePipeline>,
    pipeline_task: Mutex<Option<JoinHandle<()>>>,
    preview: PreviewStreamer,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    weak_self: Weak<SessionManager>,
}

impl SessionManager {
    /// Build the coordinator and start the pose cycle
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: PosecastConfig,
        factory: Arc<dyn TransportFactory>,
        detector: Arc<dyn LandmarkDetector>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let names = config.slot_names();
        let store = Arc::new(FrameStore::new(names.clone(), config.buffer_capacity));
        let slots = SlotPool::new(names, Arc::clone(&store));
        let hub = Arc::new(BroadcastHub::new());
        let rig = Arc::new(StereoRig::from_config(&config));
        let preview = PreviewStreamer::new(&config, Arc::clone(&store))?;
        let pipeline = Arc::new(PosePipeline::new(
            &config,
            Arc::clone(&slots),
            PoseEstimator::new(detector).with_min_visibility(config.min_visibility),
            Arc::clone(&rig),
            Arc::clone(&hub),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        let pipeline_task = Arc::clone(&pipeline).spawn(shutdown_tx.subscribe());

        info!(
            "Session manager ready: {} slots, {}x{} @ {} fps, baseline {} m",
            config.max_camera_slots,
            config.image_width,
            config.image_height,
            config.target_fps,
            config.baseline_m
        );

        Ok(Arc::new_cyclic(|weak_self| Self {
            factory,
            sessions: RwLock::new(HashMap::new()),
            slots,
            store,
            hub,
            rig,
            pipeline,
            pipeline_task: Mutex::new(Some(pipeline_task)),
            preview,
            shutdown_tx,
            shutting_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        }))
    }

    /// Negotiate a camera peer
    ///
    /// Media tracks that arrive on the session are bound to free slots; a
    /// track with no free slot is rejected while the session stays up.
    #[instrument(skip(self, offer))]
    pub async fn negotiate_camera(&self, offer: SessionDescription) -> Result<NegotiatedSession> {
        self.negotiate(PeerRole::Camera, offer).await
    }

    /// Negotiate a monitor peer
    ///
    /// Side channels the monitor opens receive a `hello` and then every
    /// pose. Bound camera streams are forwarded when the transport supports
    /// outbound media.
    #[instrument(skip(self, offer))]
    pub async fn negotiate_monitor(&self, offer: SessionDescription) -> Result<NegotiatedSession> {
        self.negotiate(PeerRole::Monitor, offer).await
    }

    async fn negotiate(
        &self,
        role: PeerRole,
        offer: SessionDescription,
    ) -> Result<NegotiatedSession> {
        self.ensure_running()?;

        if offer.sdp_type != SdpType::Offer {
            return Err(Error::Negotiation(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }
        if offer.sdp.trim().is_empty() {
            return Err(Error::Negotiation("offer has an empty SDP".to_string()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let transport = self.factory.create(&session_id, role).await?;
        let entry = Arc::new(SessionEntry {
            session: Mutex::new(PeerSession::new(session_id.clone(), role)),
            transport: Arc::clone(&transport),
        });
        self.sessions
            .write()
            .insert(session_id.clone(), Arc::clone(&entry));

        self.wire_callbacks(&session_id, role, transport.as_ref());

        if role == PeerRole::Monitor {
            self.attach_outbound(&session_id, transport.as_ref());
        }

        let answer = match transport.create_answer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Negotiation failed for {} session {}: {}", role, session_id, e);
                self.discard(&session_id, &entry).await;
                return Err(match e {
                    Error::Negotiation(_) => e,
                    other => Error::Negotiation(other.to_string()),
                });
            }
        };

        if self.shutting_down.load(Ordering::SeqCst) {
            self.discard(&session_id, &entry).await;
            return Err(Error::ShuttingDown);
        }

        entry.session.lock().transition(SessionState::Connected)?;
        info!("Negotiated {} session {}", role, session_id);

        Ok(NegotiatedSession {
            session_id,
            answer,
        })
    }

    fn wire_callbacks(&self, session_id: &str, role: PeerRole, transport: &dyn PeerTransport) {
        match role {
            PeerRole::Camera => {
                let weak = self.weak_self.clone();
                let id = session_id.to_string();
                transport.on_track_received(Box::new(move |stream| {
                    weak.upgrade()
                        .is_some_and(|manager| manager.on_camera_track(&id, stream))
                }));
            }
            PeerRole::Monitor => {
                let weak = self.weak_self.clone();
                let id = session_id.to_string();
                transport.on_channel_opened(Box::new(move |channel| {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_monitor_channel(&id, channel);
                    }
                }));
            }
        }

        let weak = self.weak_self.clone();
        let id = session_id.to_string();
        transport.on_closed(Box::new(move || {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.close_session(&id).await {
                    debug!("Close on disconnect for session {}: {}", id, e);
                }
            });
        }));
    }

    /// Register currently bound camera streams for a monitor, best-effort
    ///
    /// Registration is synchronous; the transport attaches the streams while
    /// answering, so the answer never waits on this.
    fn attach_outbound(&self, session_id: &str, transport: &dyn PeerTransport) {
        for (slot, stream) in self.slots.bound_streams() {
            match transport.add_outbound_stream(stream) {
                Ok(()) => debug!("Forwarding slot {} to monitor {}", slot, session_id),
                Err(e) => {
                    debug!("Monitor {} gets no raw video: {}", session_id, e);
                    return;
                }
            }
        }
    }

    /// Bind a camera track to a slot; `false` when it was refused
    fn on_camera_track(&self, session_id: &str, stream: Arc<dyn MediaStream>) -> bool {
        let Some(entry) = self.entry(session_id) else {
            debug!("Track {} for unknown session {}", stream.id(), session_id);
            return false;
        };

        // Holding the session lock keeps a concurrent close from missing this track
        let mut session = entry.session.lock();
        if !session.is_active() || self.shutting_down.load(Ordering::SeqCst) {
            debug!("Ignoring track {} on closing session {}", stream.id(), session_id);
            return false;
        }

        match self.slots.assign(Arc::clone(&stream)) {
            Assignment::Bound(handle) => {
                session.tracks.insert(handle.stream_id);
                true
            }
            Assignment::Rejected => {
                warn!(
                    "Camera session {} track {} rejected: all {} slots occupied",
                    session_id,
                    stream.id(),
                    self.slots.names().len()
                );
                false
            }
        }
    }

    fn on_monitor_channel(&self, session_id: &str, channel: Arc<dyn SideChannel>) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let id = session_id.to_string();

        tokio::spawn(async move {
            let calibration = manager.rig.calibration();
            if manager.hub.send_hello(&channel, &calibration).await.is_err() {
                return;
            }

            let Some(entry) = manager.entry(&id) else {
                return;
            };
            let mut session = entry.session.lock();
            if !session.is_active() {
                return;
            }
            session.channels.insert(channel.id().to_string());
            manager.hub.register(channel);
        });
    }

    /// Close one session; closing an already closed session is not an error
    #[instrument(skip(self))]
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let (tracks, channels) = {
            let mut session = entry.session.lock();
            if !session.is_active() {
                return Ok(());
            }
            session.transition(SessionState::Closing)?;
            (
                std::mem::take(&mut session.tracks),
                std::mem::take(&mut session.channels),
            )
        };

        for track in &tracks {
            if let Some(slot) = self.slots.release_stream(track) {
                info!("Session {} closed, freed slot {}", session_id, slot);
            }
        }
        for channel in &channels {
            self.hub.unregister(channel);
        }

        if let Err(e) = entry.transport.close().await {
            warn!("Error closing transport for session {}: {}", session_id, e);
        }

        let _ = entry.session.lock().transition(SessionState::Closed);
        self.sessions.write().remove(session_id);
        info!("Session {} closed", session_id);
        Ok(())
    }

    /// Drop a session whose negotiation did not complete
    async fn discard(&self, session_id: &str, entry: &SessionEntry) {
        let _ = entry.session.lock().transition(SessionState::Closed);
        self.sessions.write().remove(session_id);
        let _ = entry.transport.close().await;
    }

    /// Close every session, release every slot and stop all background tasks
    ///
    /// Returns once nothing started by the manager is still running. Calling
    /// it again is a no-op.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return Ok(());
        }
        info!("Shutting down session manager");

        let _ = self.shutdown_tx.send(());
        let task = self.pipeline_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Pose cycle task failed: {}", e);
            }
        }

        self.preview.shutdown().await;

        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        let closes = ids.iter().map(|id| self.close_session(id));
        for (id, result) in ids.iter().zip(futures::future::join_all(closes).await) {
            if let Err(e) = result {
                debug!("Session {} already gone during shutdown: {}", id, e);
            }
        }

        self.slots.release_all().await;
        self.store.clear_all();
        self.hub.clear();

        info!("Session manager shut down");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    fn entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.entry(session_id).map(|e| e.session.lock().info())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let entries: Vec<Arc<SessionEntry>> = self.sessions.read().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = entries.iter().map(|e| e.session.lock().info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn status(&self) -> ServerStatus {
        let mut counts = SessionCounts::default();
        for info in self.sessions() {
            match info.role {
                PeerRole::Camera => counts.camera += 1,
                PeerRole::Monitor => counts.monitor += 1,
            }
        }

        ServerStatus {
            slots: self.slots.status(),
            sessions: counts,
            sinks: self.hub.len(),
            preview_viewers: self.preview.viewer_count(),
            ingestion_tasks: self.slots.running_tasks(),
            pipeline: self.pipeline.stats(),
            shutting_down: self.shutting_down.load(Ordering::SeqCst),
        }
    }

    /// Start a preview stream for one viewer of `slot`
    pub fn preview_stream(&self, slot: &str) -> Result<ReceiverStream<Bytes>> {
        self.ensure_running()?;
        self.preview.stream(slot)
    }

    pub fn preview(&self) -> &PreviewStreamer {
        &self.preview
    }

    pub fn slots(&self) -> &Arc<SlotPool> {
        &self.slots
    }

    pub fn frames(&self) -> &Arc<FrameStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn pipeline(&self) -> &Arc<PosePipeline> {
        &self.pipeline
    }

    pub fn rig(&self) -> &Arc<StereoRig> {
        &self.rig
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_terminal() {
        let mut session = PeerSession::new("s1", PeerRole::Camera);
        assert!(session.is_active());
        session.transition(SessionState::Connected).unwrap();
        session.transition(SessionState::Closing).unwrap();
        assert!(!session.is_active());
        session.transition(SessionState::Closed).unwrap();

        assert!(matches!(
            session.transition(SessionState::Connected),
            Err(Error::SessionClosed(_))
        ));
        assert!(session.transition(SessionState::Closed).is_ok());
    }

    #[test]
    fn test_negotiated_session_wire_format() {
        let negotiated = NegotiatedSession {
            session_id: "abc".to_string(),
            answer: SessionDescription::answer("v=0"),
        };
        let json = serde_json::to_value(&negotiated).unwrap();
        assert_eq!(json["session_id"], "abc");
        assert_eq!(json["type"], "answer");
        assert_eq!(json["sdp"], "v=0");
    }
}
