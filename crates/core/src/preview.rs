//! Per-camera MJPEG preview
//!
//! Every viewer gets its own producer task that, at the preview rate, reads
//! the slot's newest frame, encodes it as JPEG and pushes it as one
//! multipart chunk. An empty slot or an unencodable frame yields the
//! placeholder image instead.

use crate::buffer::FrameStore;
use crate::config::PosecastConfig;
use crate::frame::{PixelFormat, VideoFrame};
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace};

/// Multipart boundary between preview images
pub const BOUNDARY: &str = "frame";

/// Content type of a preview response
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Chunks buffered per viewer before the producer waits
const VIEWER_QUEUE: usize = 2;

/// JPEG encoder for preview frames
pub struct PreviewEncoder {
    quality: u8,
    scale: u32,
    grayscale: bool,
    placeholder: Bytes,
}

impl PreviewEncoder {
    /// Build an encoder and pre-encode the placeholder image
    pub fn new(config: &PosecastConfig) -> Result<Self> {
        let mut encoder = Self {
            quality: config.preview.jpeg_quality,
            scale: config.preview.scale.max(1),
            grayscale: config.preview.grayscale,
            placeholder: Bytes::new(),
        };
        let black = VideoFrame::black(config.image_width, config.image_height);
        encoder.placeholder = encoder.encode(&black)?;
        Ok(encoder)
    }

    /// Encode a frame as JPEG
    ///
    /// Compressed codec payloads are rejected; they have to be decoded
    /// before they can be previewed.
    pub fn encode(&self, frame: &VideoFrame) -> Result<Bytes> {
        let mut image = to_image(frame)?;

        if self.grayscale {
            image = DynamicImage::ImageLuma8(image.to_luma8());
        }

        if self.scale > 1 {
            let width = (image.width() / self.scale).max(1);
            let height = (image.height() / self.scale).max(1);
            image = image.resize_exact(width, height, FilterType::Triangle);
        }

        if !self.grayscale && !matches!(image, DynamicImage::ImageRgb8(_)) {
            image = DynamicImage::ImageRgb8(image.to_rgb8());
        }

        let mut out = Vec::new();
        image.write_with_encoder(JpegEncoder::new_with_quality(&mut out, self.quality))?;
        Ok(Bytes::from(out))
    }

    /// Encoded black frame of the configured (scaled) resolution
    pub fn placeholder(&self) -> Bytes {
        self.placeholder.clone()
    }
}

fn to_image(frame: &VideoFrame) -> Result<DynamicImage> {
    let (w, h) = (frame.width, frame.height);
    let bad_length = || {
        Error::Encoding(format!(
            "{:?} payload of {} bytes does not match {}x{}",
            frame.format,
            frame.data.len(),
            w,
            h
        ))
    };

    match frame.format {
        PixelFormat::Rgb24 => RgbImage::from_raw(w, h, frame.data.to_vec())
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(bad_length),
        PixelFormat::Bgr24 => {
            let mut data = frame.data.to_vec();
            for px in data.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            RgbImage::from_raw(w, h, data)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(bad_length)
        }
        PixelFormat::Gray8 => GrayImage::from_raw(w, h, frame.data.to_vec())
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(bad_length),
        PixelFormat::Jpeg => Ok(image::load_from_memory_with_format(
            &frame.data,
            ImageFormat::Jpeg,
        )?),
        PixelFormat::Encoded(codec) => Err(Error::Encoding(format!(
            "{} frames must be decoded before preview",
            codec.mime_type()
        ))),
    }
}

/// Wrap one JPEG as a multipart part
pub fn multipart_chunk(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut chunk = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// Serves preview streams and tracks their producer tasks
pub struct PreviewStreamer {
    store: Arc<FrameStore>,
    encoder: Arc<PreviewEncoder>,
    interval: Duration,
    viewers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl PreviewStreamer {
    pub fn new(config: &PosecastConfig, store: Arc<FrameStore>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            store,
            encoder: Arc::new(PreviewEncoder::new(config)?),
            interval: config.preview_interval(),
            viewers: Mutex::new(Vec::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Start a preview stream for one viewer
    ///
    /// The stream never ends on its own; dropping it stops the producer at
    /// its next send.
    pub fn stream(&self, slot: &str) -> Result<ReceiverStream<Bytes>> {
        if !self.store.contains(slot) {
            return Err(Error::SlotNotFound(slot.to_string()));
        }

        // Closed check, subscription and registration happen under the
        // viewers lock, which shutdown also takes before signalling
        let mut viewers = self.viewers.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let (tx, rx) = mpsc::channel(VIEWER_QUEUE);
        let handle = tokio::spawn(run_viewer(
            slot.to_string(),
            Arc::clone(&self.store),
            Arc::clone(&self.encoder),
            self.interval,
            tx,
            self.shutdown_tx.subscribe(),
        ));

        viewers.retain(|h| !h.is_finished());
        viewers.push(handle);
        info!("Preview viewer attached to slot {} ({} active)", slot, viewers.len());

        Ok(ReceiverStream::new(rx))
    }

    pub fn viewer_count(&self) -> usize {
        let mut viewers = self.viewers.lock();
        viewers.retain(|h| !h.is_finished());
        viewers.len()
    }

    pub fn encoder(&self) -> &PreviewEncoder {
        &self.encoder
    }

    /// Stop every producer and wait for them to exit
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut viewers = self.viewers.lock();
            self.closed.store(true, Ordering::SeqCst);
            let _ = self.shutdown_tx.send(());
            std::mem::take(&mut *viewers)
        };
        for handle in handles {
            let _ = handle.await;
        }
        debug!("Preview streamer shut down");
    }
}

async fn run_viewer(
    slot: String,
    store: Arc<FrameStore>,
    encoder: Arc<PreviewEncoder>,
    interval: Duration,
    tx: mpsc::Sender<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last: Option<(f64, Bytes)> = None;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            _ = ticker.tick() => {}
        }

        let jpeg = match store.latest(&slot) {
            None => encoder.placeholder(),
            Some(record) => match last
                .as_ref()
                .filter(|(ts, _)| *ts == record.timestamp)
                .map(|(_, jpeg)| jpeg.clone())
            {
                Some(jpeg) => jpeg,
                None => {
                    let enc = Arc::clone(&encoder);
                    let frame = Arc::clone(&record.frame);
                    let encoded = tokio::task::spawn_blocking(move || enc.encode(&frame))
                        .await
                        .map_err(|e| Error::Encoding(e.to_string()))
                        .and_then(|r| r);
                    let jpeg = match encoded {
                        Ok(jpeg) => jpeg,
                        Err(e) => {
                            trace!("Preview encode failed for slot {}: {}", slot, e);
                            encoder.placeholder()
                        }
                    };
                    last = Some((record.timestamp, jpeg.clone()));
                    jpeg
                }
            },
        };

        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            sent = tx.send(multipart_chunk(&jpeg)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Preview viewer for slot {} stopped", slot);
}
