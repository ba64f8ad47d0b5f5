//! HTTP MJPEG / JPEG snapshot source.
//!
//! A `multipart/x-mixed-replace` response is read as a continuous MJPEG
//! stream; any other content type is treated as a snapshot endpoint that is
//! polled once per frame. JPEG bytes are passed through undecoded; the
//! segment builder decodes them off the capture thread.
//!
//! Capture timestamps are measured from the first successful connect and
//! keep counting across reconnects.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use super::{frame_interval, health_grace, CapturedImage, FrameSource, SourceConfig, SourceStats};
use crate::frame::RawImage;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MjpegSource {
    config: SourceConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    /// Zero point of `captured_at`; set once.
    clock_base: Option<Instant>,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

impl MjpegSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let url = url::Url::parse(&config.url).context("parse mjpeg url")?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported mjpeg scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(Duration::from_secs(10))
            .build();
        Ok(Self {
            config,
            agent,
            stream: None,
            clock_base: None,
            connected_at: None,
            last_frame_at: None,
            frame_count: 0,
            last_error: None,
        })
    }

    fn fetch_single_jpeg(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("fetch jpeg snapshot from {}", self.config.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64 + 1)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(anyhow!("jpeg snapshot exceeds {} bytes", MAX_JPEG_BYTES));
        }
        Ok(bytes)
    }

    fn attach(&mut self, stream: HttpStream) {
        let now = Instant::now();
        self.clock_base.get_or_insert(now);
        self.connected_at = Some(now);
        self.stream = Some(stream);
        self.last_error = None;
    }

    /// How long a snapshot poll must wait to honour the target rate.
    fn snapshot_delay(&self, now: Instant) -> Option<Duration> {
        let last = self.last_frame_at?;
        let due = last + frame_interval(self.config.target_fps);
        (due > now).then(|| due - now)
    }

    fn read_jpeg(&mut self) -> Result<Vec<u8>> {
        let single = matches!(self.stream, Some(HttpStream::SingleJpeg));
        if single {
            return self.fetch_single_jpeg();
        }
        match self.stream.as_mut() {
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg(),
            _ => Err(anyhow!("mjpeg source not connected; call connect() first")),
        }
    }
}

impl FrameSource for MjpegSource {
    fn connect(&mut self) -> Result<()> {
        self.stream = None;
        let response = match self.agent.get(&self.config.url).call() {
            Ok(response) => response,
            Err(e) => {
                self.last_error = Some(e.to_string());
                return Err(anyhow!(e).context("connect to mjpeg stream"));
            }
        };
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            self.attach(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
        } else {
            self.attach(HttpStream::SingleJpeg);
        }
        log::info!(
            "MjpegSource: connected to {} ({})",
            self.config.url,
            if content_type.contains("multipart") {
                "stream"
            } else {
                "snapshot"
            }
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedImage> {
        let clock_base = self
            .clock_base
            .ok_or_else(|| anyhow!("mjpeg source not connected; call connect() first"))?;
        let min_interval = frame_interval(self.config.target_fps);
        loop {
            if matches!(self.stream, Some(HttpStream::SingleJpeg)) {
                if let Some(delay) = self.snapshot_delay(Instant::now()) {
                    std::thread::sleep(delay);
                }
            }
            let jpeg = match self.read_jpeg() {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    self.last_error = Some(format!("{:#}", e));
                    return Err(e);
                }
            };

            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                if now.duration_since(last) < min_interval {
                    continue;
                }
            }
            self.frame_count += 1;
            self.last_frame_at = Some(now);
            return Ok(CapturedImage {
                image: RawImage::jpeg(jpeg),
                captured_at: now.duration_since(clock_base),
            });
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= CONNECT_TIMEOUT;
        };
        last_frame_at.elapsed() <= health_grace(self.config.target_fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            // Runaway part with no end marker: keep the tail, resync on the next SOI.
            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

/// Byte range of the first complete JPEG (SOI..=EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn finds_jpeg_between_multipart_headers() {
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        body.extend_from_slice(b"\r\n--frame\r\n");
        let (start, end) = find_jpeg_bounds(&body).unwrap();
        assert_eq!(&body[start..end], &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        assert!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00]).is_none());
    }

    #[test]
    fn stream_yields_consecutive_parts() {
        let mut body = Vec::new();
        for n in 0..3u8 {
            body.extend_from_slice(b"--frame\r\n\r\n");
            body.extend_from_slice(&[0xFF, 0xD8, n, 0xFF, 0xD9]);
        }
        let mut stream = MjpegStream::new(Box::new(Cursor::new(body)));
        for n in 0..3u8 {
            assert_eq!(stream.read_next_jpeg().unwrap()[2], n);
        }
        assert!(stream.read_next_jpeg().is_err());
    }

    fn stream_of(parts: u8) -> HttpStream {
        let mut body = Vec::new();
        for n in 0..parts {
            body.extend_from_slice(b"--frame\r\n\r\n");
            body.extend_from_slice(&[0xFF, 0xD8, n, 0xFF, 0xD9]);
        }
        HttpStream::Mjpeg(MjpegStream::new(Box::new(Cursor::new(body))))
    }

    fn unpaced_source() -> MjpegSource {
        MjpegSource::new(SourceConfig {
            url: "http://127.0.0.1:9/stream".to_string(),
            target_fps: 0,
            ..SourceConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn timestamps_keep_rising_across_reconnects() {
        let mut source = unpaced_source();
        source.attach(stream_of(2));
        let first = source.next_frame().unwrap().captured_at;
        let second = source.next_frame().unwrap().captured_at;
        assert!(source.next_frame().is_err());

        std::thread::sleep(Duration::from_millis(20));
        source.attach(stream_of(1));
        let after_reconnect = source.next_frame().unwrap().captured_at;
        assert!(first <= second);
        assert!(after_reconnect >= second + Duration::from_millis(20));
        assert_eq!(source.stats().frames_captured, 3);
    }

    #[test]
    fn snapshot_polls_wait_for_the_frame_interval() {
        let mut source = MjpegSource::new(SourceConfig {
            url: "http://127.0.0.1:9/snapshot.jpg".to_string(),
            target_fps: 10,
            ..SourceConfig::default()
        })
        .unwrap();
        let now = Instant::now();
        assert_eq!(source.snapshot_delay(now), None);

        source.last_frame_at = Some(now);
        assert_eq!(
            source.snapshot_delay(now + Duration::from_millis(40)),
            Some(Duration::from_millis(60))
        );
        assert_eq!(source.snapshot_delay(now + Duration::from_millis(100)), None);
    }

    #[test]
    fn unconnected_source_is_unhealthy() {
        let source = MjpegSource::new(SourceConfig {
            url: "http://127.0.0.1:9/stream".to_string(),
            ..SourceConfig::default()
        })
        .unwrap();
        assert!(!source.is_healthy());
        assert!(MjpegSource::new(SourceConfig {
            url: "udp://127.0.0.1:9".to_string(),
            ..SourceConfig::default()
        })
        .is_err());
    }
}
