//! Pose cycle
//!
//! Runs at a fixed rate, independent of frame arrival. Each tick looks at the
//! first two camera slots: with both bound it triangulates a synchronized
//! pair, with one bound it emits the degraded single-view pose. Every
//! failure along the way just skips the tick.

use crate::broadcast::{BroadcastHub, PoseMode, PoseResult};
use crate::buffer::FrameStore;
use crate::config::PosecastConfig;
use crate::frame::{Point3, VideoFrame};
use crate::pose::PoseEstimator;
use crate::slots::SlotPool;
use crate::triangulation::{degrade, StereoRig};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Pose cycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub ticks: u64,
    pub stereo_poses: u64,
    pub degraded_poses: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    stereo_poses: AtomicU64,
    degraded_poses: AtomicU64,
    skipped: AtomicU64,
}

/// What was last handed to the detector, so a tick never repeats work
#[derive(Debug, Clone, Copy, PartialEq)]
enum Processed {
    Pair(f64, f64),
    Single(usize, f64),
}

pub struct PosePipeline {
    slots: Arc<SlotPool>,
    store: Arc<FrameStore>,
    estimator: PoseEstimator,
    rig: Arc<StereoRig>,
    hub: Arc<BroadcastHub>,
    slot_a: String,
    slot_b: Option<String>,
    tolerance: f64,
    interval: Duration,
    last: Mutex<Option<Processed>>,
    counters: Counters,
}

impl PosePipeline {
    pub fn new(
        config: &PosecastConfig,
        slots: Arc<SlotPool>,
        estimator: PoseEstimator,
        rig: Arc<StereoRig>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        let names = slots.names();
        let slot_a = names
            .first()
            .cloned()
            .unwrap_or_else(|| "cam1".to_string());
        let slot_b = names.get(1).cloned();

        Self {
            store: Arc::clone(slots.store()),
            slots,
            estimator,
            rig,
            hub,
            slot_a,
            slot_b,
            tolerance: config.sync_tolerance_secs,
            interval: config.frame_interval(),
            last: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Start the cycle; it runs until `shutdown` fires
    pub fn spawn(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                "Pose cycle started at {:.1} Hz using detector {}",
                1.0 / self.interval.as_secs_f64(),
                self.estimator.detector_name()
            );

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.recv() => {
                        info!("Shutting down pose cycle");
                        break;
                    }

                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                }
            }
        })
    }

    /// Run one tick; returns the pose that was broadcast, if any
    pub async fn run_cycle(&self) -> Option<PoseResult> {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let pose = match self.compute().await {
            Some(pose) => pose,
            None => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match pose.mode {
            PoseMode::Stereo => self.counters.stereo_poses.fetch_add(1, Ordering::Relaxed),
            PoseMode::Degraded => self.counters.degraded_poses.fetch_add(1, Ordering::Relaxed),
        };

        match self.hub.broadcast(&pose).await {
            Ok(stats) if stats.failed_count > 0 => {
                debug!(
                    "Pose delivered to {}/{} sinks",
                    stats.sent_count, stats.total_sinks
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to broadcast pose: {}", e),
        }

        Some(pose)
    }

    async fn compute(&self) -> Option<PoseResult> {
        let a_bound = self.slots.is_occupied(&self.slot_a);
        let b_bound = self
            .slot_b
            .as_deref()
            .is_some_and(|b| self.slots.is_occupied(b));

        match (a_bound, b_bound) {
            (true, true) => self.stereo().await,
            (true, false) => self.single(0, &self.slot_a).await,
            (false, true) => match self.slot_b.as_deref() {
                Some(b) => self.single(1, b).await,
                None => None,
            },
            (false, false) => {
                trace!("No camera bound, skipping tick");
                None
            }
        }
    }

    async fn stereo(&self) -> Option<PoseResult> {
        let slot_b = self.slot_b.as_deref()?;
        let (a, b) = self
            .store
            .synchronized_pair(&self.slot_a, slot_b, self.tolerance)?;

        if !self.mark(Processed::Pair(a.timestamp, b.timestamp)) {
            return None;
        }

        let (left, right) = tokio::join!(
            self.detect(Arc::clone(&a.frame)),
            self.detect(Arc::clone(&b.frame))
        );
        let (left, right) = (left?, right?);

        let Some(points) = self.rig.triangulate(&left, &right) else {
            debug!(
                "Landmark count mismatch ({} vs {}), skipping tick",
                left.len(),
                right.len()
            );
            return None;
        };

        Some(PoseResult {
            points,
            mode: PoseMode::Stereo,
            timestamp: a.timestamp,
        })
    }

    async fn single(&self, index: usize, slot: &str) -> Option<PoseResult> {
        let record = self.store.latest(slot)?;
        if !self.mark(Processed::Single(index, record.timestamp)) {
            return None;
        }

        let landmarks = self.detect(Arc::clone(&record.frame)).await?;
        Some(PoseResult {
            points: degrade(&landmarks),
            mode: PoseMode::Degraded,
            timestamp: record.timestamp,
        })
    }

    /// Record `key` as processed; `false` if it already was
    fn mark(&self, key: Processed) -> bool {
        let mut last = self.last.lock();
        if *last == Some(key) {
            return false;
        }
        *last = Some(key);
        true
    }

    async fn detect(&self, frame: Arc<VideoFrame>) -> Option<Vec<Point3>> {
        let estimator = self.estimator.clone();
        match tokio::task::spawn_blocking(move || estimator.detect(&frame)).await {
            Ok(landmarks) => landmarks,
            Err(e) => {
                warn!("Landmark detection task failed: {}", e);
                None
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            stereo_poses: self.counters.stereo_poses.load(Ordering::Relaxed),
            degraded_poses: self.counters.degraded_poses.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }
}
