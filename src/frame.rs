//! Frames and the bounded ingestion buffer.
//!
//! - `RawImage`: pixel payload as produced by a frame source.
//! - `Frame`: an ingested image with its capture timestamp and sequence number.
//! - `FrameIngestor`: bounded FIFO between the frame source and the segment builder.
//!
//! The ingestor never grows beyond its capacity. When the buffer is full the
//! oldest frame is evicted, so the segment builder always sees the freshest
//! frames the buffer can hold.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default ingest buffer capacity. At 10 fps this is three seconds of video.
pub const DEFAULT_BUFFER_FRAMES: usize = 30;

// ----------------------------------------------------------------------------
// Frame payloads
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgb24,
    Nv12,
    /// Encoded JPEG bytes; width/height are advisory until decoded.
    Jpeg,
}

/// Image payload handed over by a frame source.
#[derive(Clone, Debug)]
pub struct RawImage {
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RawImage {
    pub fn rgb(pixels: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            format: PixelFormat::Rgb24,
            pixels,
            width,
            height,
        }
    }

    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            format: PixelFormat::Jpeg,
            pixels: bytes,
            width: 0,
            height: 0,
        }
    }
}

/// An ingested frame. Immutable once created.
#[derive(Debug)]
pub struct Frame {
    image: RawImage,
    captured_at: Duration,
    seq: u64,
}

impl Frame {
    pub(crate) fn new(image: RawImage, captured_at: Duration, seq: u64) -> Self {
        Self {
            image,
            captured_at,
            seq,
        }
    }

    /// Monotonic capture timestamp, relative to the source's start.
    pub fn captured_at(&self) -> Duration {
        self.captured_at
    }

    /// Sequence number assigned at ingest. Strictly increasing per ingestor.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn format(&self) -> PixelFormat {
        self.image.format
    }

    pub fn width(&self) -> u32 {
        self.image.width
    }

    pub fn height(&self) -> u32 {
        self.image.height
    }

    pub fn byte_len(&self) -> usize {
        self.image.pixels.len()
    }

    /// Decode/convert the payload into an RGB image.
    pub fn to_rgb(&self) -> Result<RgbImage> {
        normalize_to_rgb(&self.image)
    }
}

pub(crate) fn normalize_to_rgb(image: &RawImage) -> Result<RgbImage> {
    let RawImage {
        format,
        pixels,
        width,
        height,
    } = image;
    let (width, height) = (*width, *height);
    match format {
        PixelFormat::Rgb24 => {
            let expected = width
                .checked_mul(height)
                .and_then(|v| v.checked_mul(3))
                .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))?
                as usize;
            if expected == 0 || pixels.len() != expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            RgbImage::from_raw(width, height, pixels.clone())
                .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", width, height))
        }
        PixelFormat::Nv12 => {
            let rgb = nv12_to_rgb(pixels, width, height)?;
            RgbImage::from_raw(width, height, rgb)
                .ok_or_else(|| anyhow!("NV12 buffer does not match {}x{}", width, height))
        }
        PixelFormat::Jpeg => Ok(image::load_from_memory(pixels)
            .context("decode jpeg")?
            .into_rgb8()),
    }
}

/// NV12: a full-resolution Y plane followed by interleaved UV samples, one
/// pair per 2x2 block. Odd dimensions round the chroma plane up.
fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let uv_stride = w.div_ceil(2) * 2;
    let expected = uv_stride
        .checked_mul(h.div_ceil(2))
        .and_then(|uv_plane| uv_plane.checked_add(y_plane))
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    if y_plane == 0 || pixels.len() != expected {
        return Err(anyhow!(
            "NV12 frame length mismatch for {}x{}: expected {}, got {}",
            width,
            height,
            expected,
            pixels.len()
        ));
    }

    let (luma, chroma) = pixels.split_at(y_plane);
    let mut rgb = Vec::with_capacity(y_plane * 3);
    for j in 0..h {
        let uv_row = &chroma[(j / 2) * uv_stride..(j / 2 + 1) * uv_stride];
        for (i, &y) in luma[j * w..(j + 1) * w].iter().enumerate() {
            let y = y as f32;
            let u = uv_row[(i / 2) * 2] as f32 - 128.0;
            let v = uv_row[(i / 2) * 2 + 1] as f32 - 128.0;

            rgb.push(clamp_to_u8(y + 1.402_f32 * v));
            rgb.push(clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v));
            rgb.push(clamp_to_u8(y + 1.772_f32 * u));
        }
    }

    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

// ----------------------------------------------------------------------------
// FrameIngestor: bounded FIFO with drop-oldest backpressure
// ----------------------------------------------------------------------------

/// What `submit` does when the buffer is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FullBufferPolicy {
    /// Evict the oldest buffered frame immediately.
    #[default]
    DropOldest,
    /// Wait up to `max_wait` for the consumer to make room, then evict the oldest.
    Block { max_wait: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Buffered,
    /// The frame was buffered after evicting the oldest frame.
    DroppedOldest,
}

/// Returned by `submit` once the ingestor has been closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IngestClosed;

impl std::fmt::Display for IngestClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame ingestor is closed")
    }
}

impl std::error::Error for IngestClosed {}

#[derive(Debug)]
pub enum Pop {
    Frame(Frame),
    /// Nothing arrived within the timeout.
    Empty,
    /// Closed and fully drained.
    Closed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub submitted: u64,
    pub dropped: u64,
    pub buffered: usize,
    pub capacity: usize,
}

/// Bounded frame buffer shared by one producer and one consumer.
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone, Debug)]
pub struct FrameIngestor {
    shared: Arc<IngestShared>,
}

#[derive(Debug)]
struct IngestShared {
    state: Mutex<IngestState>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    policy: FullBufferPolicy,
}

#[derive(Debug)]
struct IngestState {
    buffer: VecDeque<Frame>,
    next_seq: u64,
    submitted: u64,
    dropped: u64,
    closed: bool,
}

impl FrameIngestor {
    pub fn new(capacity: usize, policy: FullBufferPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(IngestShared {
                state: Mutex::new(IngestState {
                    buffer: VecDeque::with_capacity(capacity),
                    next_seq: 0,
                    submitted: 0,
                    dropped: 0,
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
                policy,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IngestState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Buffer a newly captured frame, assigning its sequence number.
    pub fn submit(
        &self,
        image: RawImage,
        captured_at: Duration,
    ) -> Result<SubmitOutcome, IngestClosed> {
        let mut state = self.lock();
        if state.closed {
            return Err(IngestClosed);
        }

        if state.buffer.len() >= self.shared.capacity {
            if let FullBufferPolicy::Block { max_wait } = self.shared.policy {
                let deadline = Instant::now() + max_wait;
                while state.buffer.len() >= self.shared.capacity && !state.closed {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    state = match self.shared.not_full.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                if state.closed {
                    return Err(IngestClosed);
                }
            }
        }

        let mut outcome = SubmitOutcome::Buffered;
        while state.buffer.len() >= self.shared.capacity {
            if let Some(evicted) = state.buffer.pop_front() {
                log::trace!("ingest buffer full, evicted frame seq={}", evicted.seq);
            }
            state.dropped += 1;
            outcome = SubmitOutcome::DroppedOldest;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.submitted += 1;
        state.buffer.push_back(Frame::new(image, captured_at, seq));
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(outcome)
    }

    /// Pull the oldest buffered frame, waiting up to `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.buffer.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Pop::Frame(frame);
            }
            if state.closed {
                return Pop::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return Pop::Empty;
            }
            state = match self.shared.not_empty.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Refuse further submissions. Buffered frames can still be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Total frames evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> IngestStats {
        let state = self.lock();
        IngestStats {
            submitted: state.submitted,
            dropped: state.dropped,
            buffered: state.buffer.len(),
            capacity: self.shared.capacity,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
