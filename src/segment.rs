//! Segment assembly.
//!
//! `SegmentBuilder` consumes ingested frames in capture order and closes a
//! segment when either configured bound is reached:
//!
//! - duration: the next frame would put the segment span at or past the target
//!   (that frame opens the next segment);
//! - frame count: the segment holds the target number of usable frames.
//!
//! Every frame is normalized to RGB, optionally resized and JPEG-encoded under
//! the transport payload cap before it enters a segment. Frames that cannot be
//! brought under the cap, or fail to decode, are recorded with a reason on the
//! segment. Segments without a single usable frame are discarded here and never
//! reach the dispatcher.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, RgbImage};
use serde::Serialize;
use std::time::Duration;

use crate::frame::Frame;

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

/// Quality steps tried, in order, when an encoded frame is over the payload cap.
const QUALITY_LADDER: [u8; 3] = [70, 55, 40];

// ----------------------------------------------------------------------------
// Policy and transform settings
// ----------------------------------------------------------------------------

/// Segment closure thresholds. `None` disables a criterion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentPolicy {
    pub target_duration: Option<Duration>,
    pub target_frames: Option<usize>,
}

impl SegmentPolicy {
    /// Build from raw configuration values; zero or negative disables a criterion.
    pub fn from_raw(target_duration_secs: f64, target_frames: i64) -> Self {
        let target_duration = if target_duration_secs.is_finite() && target_duration_secs > 0.0 {
            // Too large to represent: saturate, settings validation rejects it.
            Some(Duration::try_from_secs_f64(target_duration_secs).unwrap_or(Duration::MAX))
        } else {
            None
        };
        let target_frames = if target_frames > 0 {
            Some(target_frames as usize)
        } else {
            None
        };
        Self {
            target_duration,
            target_frames,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.target_duration.is_some() || self.target_frames.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizeTarget {
    pub width: u32,
    pub height: u32,
    /// Fit inside the target box instead of stretching. Never upscales.
    pub keep_aspect: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameTransform {
    pub resize: Option<ResizeTarget>,
    pub jpeg_quality: u8,
    /// Maximum encoded bytes per frame. `None` means unlimited.
    pub max_payload_bytes: Option<usize>,
}

impl Default for FrameTransform {
    fn default() -> Self {
        Self {
            resize: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_payload_bytes: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Segment data
// ----------------------------------------------------------------------------

/// A frame as carried inside a segment: JPEG bytes ready for transport.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub seq: u64,
    pub captured_at: Duration,
    pub width: u32,
    pub height: u32,
    pub jpeg: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DropReason {
    DecodeFailed { detail: String },
    EncodeFailed { detail: String },
    PayloadTooLarge { bytes: usize, limit: usize },
    OutOfOrder { last_seq: u64 },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::DecodeFailed { detail } => write!(f, "decode failed: {}", detail),
            DropReason::EncodeFailed { detail } => write!(f, "encode failed: {}", detail),
            DropReason::PayloadTooLarge { bytes, limit } => {
                write!(f, "payload {} bytes exceeds limit {}", bytes, limit)
            }
            DropReason::OutOfOrder { last_seq } => {
                write!(f, "sequence not after last accepted seq {}", last_seq)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DroppedFrame {
    pub seq: u64,
    pub reason: DropReason,
}

/// Capture time span covered by a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Duration,
    pub end: Duration,
}

impl TimeRange {
    pub fn span(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// An ordered, bounded run of frames submitted to the VLM as one unit.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    frames: Vec<EncodedFrame>,
    range: TimeRange,
    dropped: Vec<DroppedFrame>,
}

impl Segment {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Usable frames in capture order. Never empty.
    pub fn frames(&self) -> &[EncodedFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Frames skipped while assembling this segment, with reasons.
    pub fn dropped(&self) -> &[DroppedFrame] {
        &self.dropped
    }

    pub fn payload_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.jpeg.len()).sum()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SegmentStats {
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub segments_emitted: u64,
    pub segments_discarded: u64,
}

// ----------------------------------------------------------------------------
// SegmentBuilder
// ----------------------------------------------------------------------------

struct OpenSegment {
    start: Duration,
    end: Duration,
    frames: Vec<EncodedFrame>,
    dropped: Vec<DroppedFrame>,
}

impl OpenSegment {
    fn new(start: Duration) -> Self {
        Self {
            start,
            end: start,
            frames: Vec::new(),
            dropped: Vec::new(),
        }
    }
}

pub struct SegmentBuilder {
    policy: SegmentPolicy,
    transform: FrameTransform,
    next_id: u64,
    last_seq: Option<u64>,
    current: Option<OpenSegment>,
    /// Drops seen while no segment was open; attached to the next one.
    orphan_drops: Vec<DroppedFrame>,
    stats: SegmentStats,
}

impl SegmentBuilder {
    pub fn new(policy: SegmentPolicy, transform: FrameTransform) -> Self {
        Self {
            policy,
            transform,
            next_id: 0,
            last_seq: None,
            current: None,
            orphan_drops: Vec::new(),
            stats: SegmentStats::default(),
        }
    }

    /// Add a frame; returns the segments closed by it (usually none, at most two).
    pub fn push(&mut self, frame: Frame) -> Vec<Segment> {
        self.stats.frames_in += 1;
        let mut closed = Vec::new();

        if let Some(last_seq) = self.last_seq {
            if frame.seq() <= last_seq {
                log::warn!(
                    "frame seq={} arrived after seq={}, skipping",
                    frame.seq(),
                    last_seq
                );
                self.stats.frames_dropped += 1;
                let dropped = DroppedFrame {
                    seq: frame.seq(),
                    reason: DropReason::OutOfOrder { last_seq },
                };
                match self.current.as_mut() {
                    Some(open) => open.dropped.push(dropped),
                    None => self.orphan_drops.push(dropped),
                }
                return closed;
            }
        }
        self.last_seq = Some(frame.seq());

        let captured_at = frame.captured_at();
        let clock_reset = match self.current.as_ref() {
            Some(open) if captured_at < open.end => {
                log::warn!(
                    "frame seq={} captured at {:.2}s, before segment end {:.2}s; starting a new segment",
                    frame.seq(),
                    captured_at.as_secs_f64(),
                    open.end.as_secs_f64()
                );
                true
            }
            _ => false,
        };
        let crosses_boundary = match (self.policy.target_duration, self.current.as_ref()) {
            (Some(target), Some(open)) => captured_at.saturating_sub(open.start) >= target,
            _ => false,
        };
        if clock_reset || crosses_boundary {
            closed.extend(self.close_current());
        }

        let orphan_drops = &mut self.orphan_drops;
        let open = self.current.get_or_insert_with(|| {
            let mut open = OpenSegment::new(captured_at);
            open.dropped.append(orphan_drops);
            open
        });
        open.end = captured_at;
        match self.transform.apply(&frame) {
            Ok(encoded) => open.frames.push(encoded),
            Err(reason) => {
                log::debug!("frame seq={} skipped: {}", frame.seq(), reason);
                self.stats.frames_dropped += 1;
                open.dropped.push(DroppedFrame {
                    seq: frame.seq(),
                    reason,
                });
            }
        }

        if let Some(target) = self.policy.target_frames {
            if open.frames.len() >= target {
                closed.extend(self.close_current());
            }
        }

        closed
    }

    /// Close whatever is open, e.g. at end of stream.
    pub fn flush(&mut self) -> Option<Segment> {
        self.close_current()
    }

    /// Number of usable frames in the open segment.
    pub fn pending_frames(&self) -> usize {
        self.current.as_ref().map_or(0, |open| open.frames.len())
    }

    pub fn stats(&self) -> SegmentStats {
        self.stats
    }

    fn close_current(&mut self) -> Option<Segment> {
        let open = self.current.take()?;
        if open.frames.is_empty() {
            self.stats.segments_discarded += 1;
            log::warn!(
                "discarding segment at {:.2}s: no usable frames ({} skipped)",
                open.start.as_secs_f64(),
                open.dropped.len()
            );
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.stats.segments_emitted += 1;
        Some(Segment {
            id,
            range: TimeRange {
                start: open.start,
                end: open.end,
            },
            frames: open.frames,
            dropped: open.dropped,
        })
    }
}

// ----------------------------------------------------------------------------
// Per-frame transform
// ----------------------------------------------------------------------------

impl FrameTransform {
    /// Normalize, resize and encode a frame under the payload cap.
    pub fn apply(&self, frame: &Frame) -> Result<EncodedFrame, DropReason> {
        let rgb = frame.to_rgb().map_err(|e| DropReason::DecodeFailed {
            detail: format!("{:#}", e),
        })?;
        let rgb = self.resize(rgb);

        let (jpeg, width, height) = self.encode_within_limit(&rgb)?;
        Ok(EncodedFrame {
            seq: frame.seq(),
            captured_at: frame.captured_at(),
            width,
            height,
            jpeg,
        })
    }

    fn target_dims(&self, width: u32, height: u32) -> (u32, u32) {
        match self.resize {
            None => (width, height),
            Some(target) if target.keep_aspect => {
                let scale = (target.width as f64 / width as f64)
                    .min(target.height as f64 / height as f64)
                    .min(1.0);
                (
                    ((width as f64 * scale).round() as u32).max(1),
                    ((height as f64 * scale).round() as u32).max(1),
                )
            }
            Some(target) => (target.width.max(1), target.height.max(1)),
        }
    }

    fn resize(&self, rgb: RgbImage) -> RgbImage {
        let (width, height) = self.target_dims(rgb.width(), rgb.height());
        if (width, height) == rgb.dimensions() {
            return rgb;
        }
        image::imageops::resize(&rgb, width, height, FilterType::Triangle)
    }

    fn encode_within_limit(&self, rgb: &RgbImage) -> Result<(Vec<u8>, u32, u32), DropReason> {
        let first = encode_jpeg(rgb, self.jpeg_quality)?;
        let Some(limit) = self.max_payload_bytes else {
            return Ok((first, rgb.width(), rgb.height()));
        };
        if first.len() <= limit {
            return Ok((first, rgb.width(), rgb.height()));
        }

        let mut smallest = first.len();
        for quality in QUALITY_LADDER
            .iter()
            .copied()
            .filter(|q| *q < self.jpeg_quality)
        {
            let jpeg = encode_jpeg(rgb, quality)?;
            if jpeg.len() <= limit {
                return Ok((jpeg, rgb.width(), rgb.height()));
            }
            smallest = smallest.min(jpeg.len());
        }

        // Last resort: halve the resolution at the lowest quality step.
        let (width, height) = ((rgb.width() / 2).max(1), (rgb.height() / 2).max(1));
        let half = image::imageops::resize(rgb, width, height, FilterType::Triangle);
        let lowest = QUALITY_LADDER[QUALITY_LADDER.len() - 1].min(self.jpeg_quality);
        let jpeg = encode_jpeg(&half, lowest)?;
        if jpeg.len() <= limit {
            return Ok((jpeg, width, height));
        }

        Err(DropReason::PayloadTooLarge {
            bytes: smallest.min(jpeg.len()),
            limit,
        })
    }
}

fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, DropReason> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| DropReason::EncodeFailed {
            detail: e.to_string(),
        })?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawImage;
    use rand::RngCore;

    fn frame_at(seq: u64, secs: f64) -> Frame {
        Frame::new(
            RawImage::rgb(vec![(seq % 256) as u8; 4 * 4 * 3], 4, 4),
            Duration::from_secs_f64(secs),
            seq,
        )
    }

    fn broken_frame(seq: u64, secs: f64) -> Frame {
        Frame::new(
            RawImage::rgb(vec![0u8; 5], 4, 4),
            Duration::from_secs_f64(secs),
            seq,
        )
    }

    fn duration_only(secs: f64) -> SegmentBuilder {
        SegmentBuilder::new(SegmentPolicy::from_raw(secs, 0), FrameTransform::default())
    }

    #[test]
    fn ten_fps_three_second_segments() {
        let mut builder = duration_only(3.0);
        let mut segments = Vec::new();
        for i in 0..45u64 {
            segments.extend(builder.push(frame_at(i, i as f64 * 0.1)));
        }
        segments.extend(builder.flush());

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].len(), 30);
        assert_eq!(segments[0].range().start, Duration::ZERO);
        assert!((segments[0].range().span().as_secs_f64() - 2.9).abs() < 1e-6);
        assert_eq!(segments[1].len(), 15);
        assert_eq!(segments[1].frames()[0].seq, 30);
        assert_eq!(segments[0].id() + 1, segments[1].id());
    }

    #[test]
    fn frame_count_closes_immediately() {
        let mut builder = SegmentBuilder::new(
            SegmentPolicy::from_raw(0.0, 4),
            FrameTransform::default(),
        );
        let mut emitted = Vec::new();
        for i in 0..10u64 {
            let closed = builder.push(frame_at(i, i as f64));
            if i % 4 == 3 {
                assert_eq!(closed.len(), 1);
            } else {
                assert!(closed.is_empty());
            }
            emitted.extend(closed);
        }
        assert_eq!(builder.pending_frames(), 2);
        emitted.extend(builder.flush());
        let sizes: Vec<usize> = emitted.iter().map(Segment::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn whichever_bound_comes_first() {
        let mut builder = SegmentBuilder::new(
            SegmentPolicy::from_raw(1.0, 3),
            FrameTransform::default(),
        );
        let mut emitted = Vec::new();
        // Sparse frames: duration bound wins.
        emitted.extend(builder.push(frame_at(0, 0.0)));
        emitted.extend(builder.push(frame_at(1, 0.6)));
        emitted.extend(builder.push(frame_at(2, 1.2)));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].len(), 2);

        // Dense frames: count bound wins.
        emitted.extend(builder.push(frame_at(3, 1.3)));
        emitted.extend(builder.push(frame_at(4, 1.4)));
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].len(), 3);
    }

    #[test]
    fn segments_are_bounded_and_non_overlapping() {
        let target = Duration::from_millis(700);
        let mut builder = SegmentBuilder::new(
            SegmentPolicy::from_raw(0.7, 5),
            FrameTransform::default(),
        );
        let mut segments = Vec::new();
        let mut t = 0.0;
        for i in 0..200u64 {
            // Irregular spacing between 10ms and 400ms.
            t += 0.01 + ((i * 37) % 40) as f64 * 0.01;
            segments.extend(builder.push(frame_at(i, t)));
        }
        segments.extend(builder.flush());

        let mut last_seq = None;
        for segment in &segments {
            assert!(!segment.is_empty());
            assert!(segment.range().span() < target);
            assert!(segment.len() <= 5);
            for frame in segment.frames() {
                if let Some(last) = last_seq {
                    assert!(frame.seq > last);
                }
                last_seq = Some(frame.seq);
            }
        }
        assert_eq!(last_seq, Some(199));
    }

    #[test]
    fn undecodable_frames_are_tallied_not_fatal() {
        let mut builder = SegmentBuilder::new(
            SegmentPolicy::from_raw(0.0, 2),
            FrameTransform::default(),
        );
        assert!(builder.push(frame_at(0, 0.0)).is_empty());
        assert!(builder.push(broken_frame(1, 0.1)).is_empty());
        let closed = builder.push(frame_at(2, 0.2));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].len(), 2);
        assert_eq!(closed[0].dropped().len(), 1);
        assert!(matches!(
            closed[0].dropped()[0].reason,
            DropReason::DecodeFailed { .. }
        ));
    }

    #[test]
    fn odd_sized_nv12_is_a_decode_failure() {
        let mut builder = duration_only(1.0);
        let nv12 = RawImage {
            format: crate::frame::PixelFormat::Nv12,
            pixels: vec![128u8; 13],
            width: 3,
            height: 3,
        };
        assert!(builder
            .push(Frame::new(nv12, Duration::ZERO, 0))
            .is_empty());
        builder.push(frame_at(1, 0.1));
        let segment = builder.flush().unwrap();
        assert_eq!(segment.len(), 1);
        assert!(matches!(
            segment.dropped()[0].reason,
            DropReason::DecodeFailed { .. }
        ));
    }

    #[test]
    fn segment_without_usable_frames_is_discarded() {
        let mut builder = duration_only(1.0);
        assert!(builder.push(broken_frame(0, 0.0)).is_empty());
        assert!(builder.push(broken_frame(1, 0.5)).is_empty());
        // Crossing the boundary closes an all-broken segment: nothing emitted.
        assert!(builder.push(frame_at(2, 1.0)).is_empty());
        assert_eq!(builder.stats().segments_discarded, 1);

        let next = builder.flush().expect("segment with one usable frame");
        assert_eq!(next.id(), 0);
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn out_of_order_frames_are_skipped() {
        let mut builder = duration_only(10.0);
        builder.push(frame_at(5, 0.0));
        builder.push(frame_at(3, 0.1));
        builder.push(frame_at(6, 0.2));
        let segment = builder.flush().unwrap();
        let seqs: Vec<u64> = segment.frames().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![5, 6]);
        assert_eq!(
            segment.dropped()[0].reason,
            DropReason::OutOfOrder { last_seq: 5 }
        );
    }

    #[test]
    fn clock_reset_starts_a_new_segment() {
        let mut builder = duration_only(3.0);
        let mut segments = Vec::new();
        for seq in 0..100u64 {
            segments.extend(builder.push(frame_at(seq, seq as f64 / 10.0)));
        }
        // Source reconnected and its clock restarted; sequence keeps counting.
        for seq in 100..250u64 {
            segments.extend(builder.push(frame_at(seq, (seq - 100) as f64 / 10.0)));
        }
        segments.extend(builder.flush());

        let sizes: Vec<usize> = segments.iter().map(|s| s.len()).collect();
        assert_eq!(sizes, vec![30, 30, 30, 10, 30, 30, 30, 30, 30]);
        for segment in &segments {
            let range = segment.range();
            assert!(range.start <= range.end);
            assert!(range.span() < Duration::from_secs(3));
            let first = segment.frames()[0].captured_at;
            let last = segment.frames()[segment.len() - 1].captured_at;
            assert_eq!((range.start, range.end), (first, last));
        }
    }

    #[test]
    fn out_of_order_between_segments_is_reported_on_next() {
        let mut builder = SegmentBuilder::new(
            SegmentPolicy::from_raw(0.0, 2),
            FrameTransform::default(),
        );
        assert!(builder.push(frame_at(0, 0.0)).is_empty());
        assert_eq!(builder.push(frame_at(1, 0.1)).len(), 1);
        // Nothing is open when the stale frame arrives.
        assert!(builder.push(frame_at(0, 0.15)).is_empty());
        assert!(builder.push(frame_at(2, 0.2)).is_empty());

        let segment = builder.flush().unwrap();
        assert_eq!(segment.len(), 1);
        assert_eq!(
            segment.dropped()[0].reason,
            DropReason::OutOfOrder { last_seq: 1 }
        );
        assert_eq!(builder.stats().frames_dropped, 1);
    }

    #[test]
    fn resize_keeps_aspect_and_never_upscales() {
        let transform = FrameTransform {
            resize: Some(ResizeTarget {
                width: 320,
                height: 320,
                keep_aspect: true,
            }),
            ..FrameTransform::default()
        };
        assert_eq!(transform.target_dims(640, 480), (320, 240));
        assert_eq!(transform.target_dims(100, 50), (100, 50));

        let stretch = FrameTransform {
            resize: Some(ResizeTarget {
                width: 32,
                height: 16,
                keep_aspect: false,
            }),
            ..FrameTransform::default()
        };
        let encoded = stretch
            .apply(&Frame::new(
                RawImage::rgb(vec![10u8; 8 * 8 * 3], 8, 8),
                Duration::ZERO,
                0,
            ))
            .unwrap();
        assert_eq!((encoded.width, encoded.height), (32, 16));
    }

    #[test]
    fn payload_cap_is_enforced() {
        let mut noise = vec![0u8; 64 * 64 * 3];
        rand::thread_rng().fill_bytes(&mut noise);
        let frame = Frame::new(RawImage::rgb(noise, 64, 64), Duration::ZERO, 0);

        let roomy = FrameTransform {
            max_payload_bytes: Some(1 << 20),
            ..FrameTransform::default()
        };
        let encoded = roomy.apply(&frame).unwrap();
        assert!(encoded.jpeg.len() <= 1 << 20);
        assert_eq!(&encoded.jpeg[..2], &[0xFF, 0xD8]);

        let tiny = FrameTransform {
            max_payload_bytes: Some(64),
            ..FrameTransform::default()
        };
        match tiny.apply(&frame) {
            Err(DropReason::PayloadTooLarge { bytes, limit }) => {
                assert_eq!(limit, 64);
                assert!(bytes > 64);
            }
            other => panic!("expected payload rejection, got {:?}", other),
        }
    }
}
