//! Synthetic frame source (`stub://`).
//!
//! Renders a noisy gray background with a red block that drives across the
//! frame every few seconds, so segments have something to describe. Capture
//! timestamps are nominal (`n / fps`), which keeps segmentation deterministic.

use anyhow::Result;
use rand::Rng;
use std::time::{Duration, Instant};

use super::{CapturedImage, FrameSource, SourceConfig, SourceStats};
use crate::frame::RawImage;

/// Frames per crossing of the red block.
const CROSSING_FRAMES: u64 = 50;

pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    paced: bool,
    started: Option<Instant>,
    /// Background brightness; shifts on every crossing to mimic a scene change.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            paced: true,
            started: None,
            scene_state: 96,
        }
    }

    /// Produce frames as fast as they are pulled instead of at `target_fps`.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn nominal_time(&self, index: u64) -> Duration {
        let fps = self.config.target_fps.max(1) as u64;
        Duration::from_micros(index * 1_000_000 / fps)
    }

    fn generate_pixels(&mut self, index: u64) -> Vec<u8> {
        let width = self.config.width.max(1) as u64;
        let height = self.config.height.max(1) as u64;

        if index > 0 && index % CROSSING_FRAMES == 0 {
            self.scene_state = self.scene_state.wrapping_add(24);
        }

        let mut rng = rand::thread_rng();
        let mut pixels = vec![0u8; (width * height * 3) as usize];
        for px in pixels.chunks_exact_mut(3) {
            let base = self.scene_state.saturating_add(rng.gen_range(0..16));
            px.copy_from_slice(&[base, base, base]);
        }

        // Red block crossing left to right, a quarter of the frame in size.
        let block_w = (width / 4).max(1);
        let block_h = (height / 4).max(1);
        let progress = index % CROSSING_FRAMES;
        let x0 = progress * width.saturating_sub(block_w) / (CROSSING_FRAMES - 1);
        let y0 = (height - block_h) / 2;
        for y in y0..y0 + block_h {
            for x in x0..(x0 + block_w).min(width) {
                let offset = ((y * width + x) * 3) as usize;
                pixels[offset..offset + 3].copy_from_slice(&[200, 24, 24]);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        self.started = Some(Instant::now());
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<CapturedImage> {
        let index = self.frame_count;
        let captured_at = self.nominal_time(index);
        if self.paced {
            let started = *self.started.get_or_insert_with(Instant::now);
            let due = started + captured_at;
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let pixels = self.generate_pixels(index);
        self.frame_count += 1;
        Ok(CapturedImage {
            image: RawImage::rgb(pixels, self.config.width, self.config.height),
            captured_at,
        })
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> SourceConfig {
        SourceConfig {
            url: "stub://test".to_string(),
            target_fps: 10,
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn synthetic_source_produces_frames() -> Result<()> {
        let mut source = SyntheticSource::new(stub_config()).unpaced();
        source.connect()?;

        let frame = source.next_frame()?;
        assert_eq!(frame.image.width, 64);
        assert_eq!(frame.image.height, 48);
        assert_eq!(frame.image.pixels.len(), 64 * 48 * 3);
        assert_eq!(source.stats().frames_captured, 1);

        Ok(())
    }

    #[test]
    fn timestamps_follow_target_fps() -> Result<()> {
        let mut source = SyntheticSource::new(stub_config()).unpaced();
        source.connect()?;
        let stamps: Vec<Duration> = (0..45)
            .map(|_| source.next_frame().map(|f| f.captured_at))
            .collect::<Result<_>>()?;
        assert_eq!(stamps[0], Duration::ZERO);
        assert_eq!(stamps[30], Duration::from_secs(3));
        assert_eq!(stamps[44], Duration::from_millis(4400));
        Ok(())
    }

    #[test]
    fn red_block_moves() -> Result<()> {
        let mut source = SyntheticSource::new(stub_config()).unpaced();
        source.connect()?;
        let first = source.next_frame()?.image.pixels;
        for _ in 0..9 {
            source.next_frame()?;
        }
        let later = source.next_frame()?.image.pixels;
        let red_column = |pixels: &[u8]| {
            (0..64usize).find(|x| {
                let offset = (24 * 64 + x) * 3;
                pixels[offset] == 200 && pixels[offset + 1] == 24
            })
        };
        assert_eq!(red_column(&first), Some(0));
        assert!(red_column(&later) > Some(0));
        Ok(())
    }
}
