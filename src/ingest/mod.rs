//! Frame sources.
//!
//! - Synthetic frames (`stub://`) for demos and tests
//! - HTTP MJPEG streams and JPEG snapshot endpoints (`http(s)://`)
//!
//! Sources only produce timestamped images. [`spawn_capture`] runs a source
//! on its own thread and submits every image to a [`FrameIngestor`], which
//! owns buffering and backpressure.

pub mod mjpeg;
pub mod synthetic;

use anyhow::{anyhow, Context, Result};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::frame::{FrameIngestor, RawImage, SubmitOutcome};

pub use mjpeg::MjpegSource;
pub use synthetic::SyntheticSource;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Configuration shared by all sources.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `stub://name` or an `http(s)://` MJPEG/JPEG URL.
    pub url: String,
    /// Target frame rate. Sources decimate to this rate.
    pub target_fps: u32,
    /// Frame width (synthetic frames only).
    pub width: u32,
    /// Frame height (synthetic frames only).
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://front_camera".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// An image as captured, before it is given a sequence number.
#[derive(Clone, Debug)]
pub struct CapturedImage {
    pub image: RawImage,
    /// Monotonic time since the source connected.
    pub captured_at: Duration,
}

#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<CapturedImage>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Build the source for a URL.
pub fn open_source(config: SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    let url = url::Url::parse(&config.url).context("parse source url")?;
    match url.scheme() {
        "http" | "https" => Ok(Box::new(MjpegSource::new(config)?)),
        other => Err(anyhow!(
            "unsupported source scheme '{}'; expected stub:// or http(s)://",
            other
        )),
    }
}

/// Run `source` on a background thread, feeding `ingestor` until the token
/// is cancelled or the ingestor is closed. Lost connections are retried
/// with exponential backoff.
pub fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    ingestor: FrameIngestor,
    cancel: CancelToken,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("frame-capture".to_string())
        .spawn(move || {
            let mut backoff = RECONNECT_MIN;
            let mut connected = false;
            while !cancel.is_cancelled() {
                if !connected {
                    match source.connect() {
                        Ok(()) => {
                            connected = true;
                            backoff = RECONNECT_MIN;
                        }
                        Err(e) => {
                            log::warn!(
                                "source connect failed: {:#}; retrying in {}s",
                                e,
                                backoff.as_secs()
                            );
                            if cancel.sleep(backoff) {
                                break;
                            }
                            backoff = (backoff * 2).min(RECONNECT_MAX);
                            continue;
                        }
                    }
                }

                let captured = match source.next_frame() {
                    Ok(captured) => captured,
                    Err(e) => {
                        log::warn!("source read failed: {:#}; reconnecting", e);
                        connected = false;
                        if cancel.sleep(RECONNECT_MIN) {
                            break;
                        }
                        continue;
                    }
                };
                match ingestor.submit(captured.image, captured.captured_at) {
                    Ok(SubmitOutcome::Buffered) => {}
                    Ok(SubmitOutcome::DroppedOldest) => {
                        log::debug!("ingest buffer full; oldest frame dropped")
                    }
                    Err(_) => break,
                }
            }
            let stats = source.stats();
            log::info!(
                "capture stopped: {} frames from {}",
                stats.frames_captured,
                stats.source
            );
        })
        .context("spawn capture thread")
}

pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FullBufferPolicy, Pop};

    #[test]
    fn picks_source_by_scheme() {
        assert!(open_source(SourceConfig::default()).is_ok());
        let http = SourceConfig {
            url: "http://10.0.0.7:81/stream".to_string(),
            ..SourceConfig::default()
        };
        assert_eq!(open_source(http).unwrap().stats().source, "http://10.0.0.7:81/stream");
        let rtsp = SourceConfig {
            url: "rtsp://camera/stream".to_string(),
            ..SourceConfig::default()
        };
        assert!(open_source(rtsp).is_err());
    }

    #[test]
    fn capture_thread_feeds_ingestor_until_cancelled() {
        let source = open_source(SourceConfig {
            url: "stub://test".to_string(),
            target_fps: 100,
            width: 8,
            height: 8,
        })
        .unwrap();
        let ingestor = FrameIngestor::new(4, FullBufferPolicy::DropOldest);
        let cancel = CancelToken::new();
        let handle = spawn_capture(source, ingestor.clone(), cancel.clone()).unwrap();

        let mut seen = Vec::new();
        for _ in 0..20 {
            if let Pop::Frame(frame) = ingestor.pop_timeout(Duration::from_millis(500)) {
                seen.push(frame.captured_at());
            }
            if seen.len() == 3 {
                break;
            }
        }
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));

        cancel.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn grace_never_below_two_seconds() {
        assert_eq!(health_grace(30), Duration::from_secs(2));
        assert_eq!(health_grace(1), Duration::from_secs(6));
        assert_eq!(frame_interval(10), Duration::from_millis(100));
    }
}
