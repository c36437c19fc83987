//! Synthetic camera feeds and a detector that reads them back

use bytes::Bytes;
use posecast_core::pose::{LandmarkDetector, RawLandmark};
use posecast_core::{PixelFormat, RelayStream, VideoFrame};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const FRAME_WIDTH: u32 = 64;
pub const FRAME_HEIGHT: u32 = 48;

/// Number of landmarks the scripted detector reports per frame
pub const LANDMARKS: usize = 3;

/// Gray frame whose first pixel carries a marker byte
///
/// A marker of zero means "no person in view".
pub fn marked_frame(marker: u8) -> Arc<VideoFrame> {
    let mut data = vec![96u8; (FRAME_WIDTH * FRAME_HEIGHT) as usize];
    data[0] = marker;
    Arc::new(
        VideoFrame::new(FRAME_WIDTH, FRAME_HEIGHT, PixelFormat::Gray8, Bytes::from(data))
            .expect("valid gray frame"),
    )
}

/// Detector that places landmarks from the frame's marker byte
///
/// The marker sets the horizontal position, so two cameras with different
/// markers see the same body with a disparity between them.
#[derive(Default)]
pub struct ScriptedDetector {
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LandmarkDetector for ScriptedDetector {
    fn detect(&self, frame: &VideoFrame) -> anyhow::Result<Vec<RawLandmark>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let marker = match frame.data.first() {
            Some(0) | None => return Ok(Vec::new()),
            Some(&m) => m,
        };

        let x = marker as f32 / 255.0;
        Ok((0..LANDMARKS)
            .map(|i| RawLandmark {
                x,
                y: 0.3 + 0.2 * i as f32,
                z: Some(-0.1),
                visibility: Some(0.99),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Publish `count` frames at `fps` with capture timestamps starting at `start`
///
/// The relay is ended after the last frame only when `end_after` is set.
pub fn spawn_feed(
    relay: Arc<RelayStream>,
    marker: u8,
    count: usize,
    fps: f64,
    start: f64,
    end_after: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs_f64(1.0 / fps);
        let mut ticker = tokio::time::interval(period);
        for i in 0..count {
            ticker.tick().await;
            relay.publish(start + i as f64 / fps, marked_frame(marker));
        }
        if end_after {
            relay.end();
        }
    })
}
