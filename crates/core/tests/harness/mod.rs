//! Session manager test harness
//!
//! Runs a real [`SessionManager`] over an in-memory transport:
//! - `MockTransportFactory` hands out `MockTransport`s whose track, channel
//!   and disconnect events are raised by the test
//! - `MockSideChannel` records what monitors receive
//! - `ScriptedDetector` derives landmarks from a marker byte in each frame

#![allow(dead_code)]

pub mod media;
pub mod transport;

use posecast_core::{PosecastConfig, SessionDescription, SessionManager, SideChannel};
use std::sync::Arc;
use std::time::Duration;

pub use media::{marked_frame, spawn_feed, ScriptedDetector, LANDMARKS};
pub use transport::{MockSideChannel, MockTransport, MockTransportFactory, MALFORMED_SDP};

/// Default wait for asynchronous effects
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize test logging (safe to call from every test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,posecast_core=debug")
        .with_test_writer()
        .try_init();
}

/// A browser-like offer
pub fn offer() -> SessionDescription {
    SessionDescription::offer("v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\n")
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct TestHarness {
    pub manager: Arc<SessionManager>,
    pub factory: Arc<MockTransportFactory>,
    pub detector: Arc<ScriptedDetector>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(PosecastConfig::default())
    }

    pub fn with_config(config: PosecastConfig) -> Self {
        Self::build(config, MockTransportFactory::new())
    }

    pub fn with_outbound(config: PosecastConfig) -> Self {
        Self::build(config, MockTransportFactory::with_outbound())
    }

    fn build(config: PosecastConfig, factory: Arc<MockTransportFactory>) -> Self {
        init_test_tracing();
        let detector = ScriptedDetector::new();
        let manager = SessionManager::new(config, factory.clone(), detector.clone())
            .expect("valid test configuration");
        Self {
            manager,
            factory,
            detector,
        }
    }

    /// Negotiate a camera peer and return its session id and transport
    pub async fn connect_camera(&self) -> (String, Arc<MockTransport>) {
        let negotiated = self
            .manager
            .negotiate_camera(offer())
            .await
            .expect("camera negotiation");
        let transport = self
            .factory
            .get(&negotiated.session_id)
            .expect("transport created for session");
        (negotiated.session_id, transport)
    }

    /// Negotiate a monitor and open its pose channel
    ///
    /// Returns once the channel is registered for broadcasts.
    pub async fn connect_monitor(&self) -> (String, Arc<MockTransport>, Arc<MockSideChannel>) {
        let negotiated = self
            .manager
            .negotiate_monitor(offer())
            .await
            .expect("monitor negotiation");
        let transport = self
            .factory
            .get(&negotiated.session_id)
            .expect("transport created for session");

        let channel = MockSideChannel::new(format!("{}-pose", negotiated.session_id));
        transport.open_channel(channel.clone());

        let hub = self.manager.hub().clone();
        let id = channel.id().to_string();
        assert!(
            wait_until(WAIT, || hub.contains(&id)).await,
            "monitor channel never registered"
        );
        (negotiated.session_id, transport, channel)
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await.expect("shutdown");
    }
}
