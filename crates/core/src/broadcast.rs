//! Skeleton broadcast fan-out
//!
//! Every successful pose cycle is serialized once and sent to all registered
//! monitor side channels. Delivery is at-most-once: a sink that is closed or
//! whose send fails is dropped from the registry.

use crate::frame::Point3;
use crate::transport::SideChannel;
use crate::triangulation::Calibration;
use crate::Result;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Messages sent from the server to monitors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// One pose, ordered by landmark index
    Pose3d { points: Vec<Point3> },
    /// Sent once when a monitor's channel opens
    Hello { calibration: Calibration, ts: f64 },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// How a pose was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoseMode {
    /// Triangulated from a synchronized pair
    Stereo,
    /// Single view, zero third coordinate
    Degraded,
}

/// One computed pose
#[derive(Debug, Clone, PartialEq)]
pub struct PoseResult {
    pub points: Vec<Point3>,
    pub mode: PoseMode,
    /// Capture timestamp of the (first) frame the pose came from
    pub timestamp: f64,
}

impl PoseResult {
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Pose3d {
            points: self.points.clone(),
        }
    }
}

/// Statistics from one broadcast
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    /// Sinks in the registry snapshot
    pub total_sinks: usize,
    /// Successful sends
    pub sent_count: usize,
    /// Sinks found closed or whose send failed
    pub failed_count: usize,
    /// Ids removed from the registry
    pub removed_sinks: Vec<String>,
    /// Duration of the fan-out in milliseconds
    pub total_duration_ms: u64,
}

/// Registry of monitor side channels
#[derive(Default)]
pub struct BroadcastHub {
    sinks: RwLock<HashMap<String, Arc<dyn SideChannel>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink; a sink with the same id is replaced
    pub fn register(&self, sink: Arc<dyn SideChannel>) {
        let id = sink.id().to_string();
        let count = {
            let mut sinks = self.sinks.write();
            sinks.insert(id.clone(), sink);
            sinks.len()
        };
        info!("Registered pose sink {} ({} total)", id, count);
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.sinks.write().remove(id).is_some();
        if removed {
            info!("Unregistered pose sink {}", id);
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sinks.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    pub fn clear(&self) {
        self.sinks.write().clear();
    }

    /// Send a pose to every registered sink
    ///
    /// Sends run concurrently over a snapshot of the registry; sinks that
    /// fail are removed afterwards. With no sinks this does nothing.
    pub async fn broadcast(&self, pose: &PoseResult) -> Result<BroadcastStats> {
        let snapshot: Vec<Arc<dyn SideChannel>> = self.sinks.read().values().cloned().collect();
        if snapshot.is_empty() {
            return Ok(BroadcastStats::default());
        }

        let start = Instant::now();
        let payload = pose.to_message().to_json()?;
        debug!(
            "Broadcasting pose ({} points) to {} sinks",
            pose.points.len(),
            snapshot.len()
        );

        let results = join_all(snapshot.iter().map(|sink| {
            let payload = payload.as_str();
            async move {
                if !sink.is_open() {
                    return Err(crate::Error::DataChannel(format!(
                        "channel {} is not open",
                        sink.id()
                    )));
                }
                sink.send_text(payload).await
            }
        }))
        .await;

        let mut stats = BroadcastStats {
            total_sinks: snapshot.len(),
            ..Default::default()
        };
        let mut failed = Vec::new();
        for (sink, result) in snapshot.iter().zip(results) {
            match result {
                Ok(()) => stats.sent_count += 1,
                Err(e) => {
                    debug!("Pose delivery to sink {} failed: {}", sink.id(), e);
                    stats.failed_count += 1;
                    failed.push(sink);
                }
            }
        }

        if !failed.is_empty() {
            let mut sinks = self.sinks.write();
            for sink in failed {
                // Only drop the exact sink that failed, not a newer one under the same id
                let same = sinks
                    .get(sink.id())
                    .is_some_and(|current| Arc::ptr_eq(current, sink));
                if same {
                    sinks.remove(sink.id());
                    stats.removed_sinks.push(sink.id().to_string());
                }
            }
        }

        for id in &stats.removed_sinks {
            info!("Removed dead pose sink {}", id);
        }

        stats.total_duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    /// Greet a newly opened sink with the rig calibration
    ///
    /// A failed greeting removes the sink if it was registered, like a
    /// failed broadcast would.
    pub async fn send_hello(
        &self,
        sink: &Arc<dyn SideChannel>,
        calibration: &Calibration,
    ) -> Result<()> {
        let message = ServerMessage::Hello {
            calibration: calibration.clone(),
            ts: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };

        let result = match message.to_json() {
            Ok(json) => sink.send_text(&json).await,
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!("Failed to send hello to sink {}: {}", sink.id(), e);
            let mut sinks = self.sinks.write();
            if sinks
                .get(sink.id())
                .is_some_and(|current| Arc::ptr_eq(current, sink))
            {
                sinks.remove(sink.id());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestSink {
        id: String,
        open: AtomicBool,
        fail: bool,
        sent: Mutex<Vec<String>>,
    }

    impl TestSink {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                open: AtomicBool::new(true),
                fail: false,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                open: AtomicBool::new(true),
                fail: true,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SideChannel for TestSink {
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
            if self.fail {
                return Err(crate::Error::DataChannel("send failed".to_string()));
            }
            self.sent.lock().push(text.to_string());
            Ok(())
        }
    }

    fn pose() -> PoseResult {
        PoseResult {
            points: vec![[0.1, 0.2, 1.5], [0.3, 0.4, 1.6]],
            mode: PoseMode::Stereo,
            timestamp: 1.0,
        }
    }

    #[test]
    fn test_message_wire_format() {
        let json = pose().to_message().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "pose3d");
        assert_eq!(value["points"].as_array().unwrap().len(), 2);
        assert_eq!(value["points"][0].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_sinks_is_noop() {
        let hub = BroadcastHub::new();
        let stats = hub.broadcast(&pose()).await.unwrap();
        assert_eq!(stats.total_sinks, 0);
        assert_eq!(stats.sent_count, 0);
        assert!(stats.removed_sinks.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_open_sink() {
        let hub = BroadcastHub::new();
        let a = TestSink::new("a");
        let b = TestSink::new("b");
        hub.register(a.clone());
        hub.register(b.clone());

        let stats = hub.broadcast(&pose()).await.unwrap();
        assert_eq!(stats.sent_count, 2);
        assert_eq!(a.sent.lock().len(), 1);
        assert_eq!(b.sent.lock()[0], a.sent.lock()[0]);
    }

    #[tokio::test]
    async fn test_closed_and_failing_sinks_removed() {
        let hub = BroadcastHub::new();
        let ok = TestSink::new("ok");
        let closed = TestSink::new("closed");
        closed.open.store(false, Ordering::SeqCst);
        hub.register(ok.clone());
        hub.register(closed.clone());
        hub.register(TestSink::failing("broken"));

        let mut stats = hub.broadcast(&pose()).await.unwrap();
        stats.removed_sinks.sort();
        assert_eq!(stats.total_sinks, 3);
        assert_eq!(stats.sent_count, 1);
        assert_eq!(stats.failed_count, 2);
        assert_eq!(stats.removed_sinks, vec!["broken", "closed"]);
        assert_eq!(hub.len(), 1);
        assert!(hub.contains("ok"));
        assert!(closed.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_hello_carries_calibration() {
        let hub = BroadcastHub::new();
        let sink = TestSink::new("m");
        hub.register(sink.clone());
        let calibration = crate::triangulation::StereoRig::from_config(&Default::default()).calibration();

        let sink_dyn: Arc<dyn SideChannel> = sink.clone();
        hub.send_hello(&sink_dyn, &calibration).await.unwrap();

        let sent = sink.sent.lock();
        let msg: ServerMessage = serde_json::from_str(&sent[0]).unwrap();
        match msg {
            ServerMessage::Hello { calibration: c, ts } => {
                assert_eq!(c, calibration);
                assert!(ts > 0.0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_hello_removes_sink() {
        let hub = BroadcastHub::new();
        let sink: Arc<dyn SideChannel> = TestSink::failing("m");
        hub.register(sink.clone());
        let calibration = crate::triangulation::StereoRig::from_config(&Default::default()).calibration();

        assert!(hub.send_hello(&sink, &calibration).await.is_err());
        assert!(hub.is_empty());
    }
}
