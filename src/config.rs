use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::{
    DispatchMode, DispatcherConfig, DEFAULT_MAX_CONCURRENT, DEFAULT_PROMPT, DEFAULT_QUEUE_DEPTH,
    DEFAULT_REQUEST_TIMEOUT_SECS,
};
use crate::frame::{FullBufferPolicy, DEFAULT_BUFFER_FRAMES};
use crate::question::poll::PollerConfig;
use crate::question::DEFAULT_QUESTION_TIMEOUT_SECS;
use crate::segment::{FrameTransform, ResizeTarget, SegmentPolicy, DEFAULT_JPEG_QUALITY};
use crate::vlm::HttpBackendConfig;

const DEFAULT_SOURCE_URL: &str = "stub://front_camera";
const DEFAULT_SOURCE_FPS: u32 = 10;
const DEFAULT_SOURCE_WIDTH: u32 = 640;
const DEFAULT_SOURCE_HEIGHT: u32 = 480;
const DEFAULT_SEGMENT_SECS: f64 = 3.0;
const DEFAULT_SEGMENT_FRAMES: i64 = 0;
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 512 * 1024;
const DEFAULT_SHUTDOWN_GRACE_SECS: f64 = 5.0;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_API_KEY_ENV: &str = "VLM_API_KEY";
const KNOWN_BACKENDS: [&str; 2] = ["stub", "http"];
/// Upper bound for every configured duration; keeps deadline arithmetic in range.
const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    source: Option<SourceConfigFile>,
    buffer: Option<BufferConfigFile>,
    segment: Option<SegmentConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    questions: Option<QuestionConfigFile>,
    vlm: Option<VlmConfigFile>,
    results: Option<ResultsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SourceConfigFile {
    url: Option<String>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct BufferConfigFile {
    capacity: Option<usize>,
    /// `drop_oldest` or `block`.
    full_policy: Option<String>,
    block_wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct SegmentConfigFile {
    target_duration_secs: Option<f64>,
    target_frames: Option<i64>,
    resize_width: Option<u32>,
    resize_height: Option<u32>,
    keep_aspect: Option<bool>,
    jpeg_quality: Option<u8>,
    max_payload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    mode: Option<DispatchMode>,
    max_concurrent: Option<usize>,
    queue_depth: Option<usize>,
    request_timeout_secs: Option<f64>,
    prompt: Option<String>,
    shutdown_grace_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct QuestionConfigFile {
    timeout_secs: Option<f64>,
    poll_url: Option<String>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct VlmConfigFile {
    backend: Option<String>,
    endpoint: Option<String>,
    model: Option<String>,
    api_key_env: Option<String>,
    max_images: Option<usize>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ResultsConfigFile {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub source: SourceSettings,
    pub buffer_capacity: usize,
    pub full_buffer: FullBufferPolicy,
    pub segment: SegmentPolicy,
    pub transform: FrameTransform,
    pub dispatch: DispatcherConfig,
    pub shutdown_grace: Duration,
    pub question_timeout: Duration,
    pub question_poll: Option<PollerConfig>,
    pub vlm: VlmSettings,
    pub results_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub url: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct VlmSettings {
    pub backend: String,
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub max_images: usize,
    pub max_tokens: u32,
}

impl VlmSettings {
    /// HTTP backend settings, with the API key read from `api_key_env`.
    pub fn http_config(&self) -> HttpBackendConfig {
        let api_key = std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        HttpBackendConfig {
            endpoint: self.endpoint.clone(),
            model: self.model.clone(),
            api_key,
            max_images: self.max_images,
            max_tokens: self.max_tokens,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let mut settings = Self::from_file(PipelineConfigFile::default());
        settings.normalize();
        settings
    }
}

impl PipelineSettings {
    /// Defaults, then the file named by `VLM_PIPELINE_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VLM_PIPELINE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file, ignoring `VLM_PIPELINE_CONFIG` but still
    /// applying environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let source_file = file.source.unwrap_or_default();
        let source = SourceSettings {
            url: source_file
                .url
                .unwrap_or_else(|| DEFAULT_SOURCE_URL.to_string()),
            target_fps: source_file.target_fps.unwrap_or(DEFAULT_SOURCE_FPS),
            width: source_file.width.unwrap_or(DEFAULT_SOURCE_WIDTH),
            height: source_file.height.unwrap_or(DEFAULT_SOURCE_HEIGHT),
        };

        let buffer = file.buffer.unwrap_or_default();
        let full_buffer = match buffer.full_policy.as_deref().map(str::trim) {
            Some("block") => FullBufferPolicy::Block {
                max_wait: Duration::from_millis(buffer.block_wait_ms.unwrap_or(100)),
            },
            Some("drop_oldest") | None => FullBufferPolicy::DropOldest,
            Some(other) => {
                log::warn!("unknown buffer.full_policy '{}', using drop_oldest", other);
                FullBufferPolicy::DropOldest
            }
        };

        let segment_file = file.segment.unwrap_or_default();
        let segment = SegmentPolicy::from_raw(
            segment_file
                .target_duration_secs
                .unwrap_or(DEFAULT_SEGMENT_SECS),
            segment_file.target_frames.unwrap_or(DEFAULT_SEGMENT_FRAMES),
        );
        let resize = match (segment_file.resize_width, segment_file.resize_height) {
            (Some(width), Some(height)) => Some(ResizeTarget {
                width,
                height,
                keep_aspect: segment_file.keep_aspect.unwrap_or(true),
            }),
            _ => None,
        };
        let transform = FrameTransform {
            resize,
            jpeg_quality: segment_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            max_payload_bytes: match segment_file.max_payload_bytes {
                Some(0) => None,
                Some(limit) => Some(limit),
                None => Some(DEFAULT_MAX_PAYLOAD_BYTES),
            },
        };

        let dispatch_file = file.dispatch.unwrap_or_default();
        let dispatch = DispatcherConfig {
            mode: dispatch_file.mode.unwrap_or_default(),
            max_concurrent: dispatch_file
                .max_concurrent
                .unwrap_or(DEFAULT_MAX_CONCURRENT),
            queue_depth: dispatch_file.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
            prompt: dispatch_file
                .prompt
                .unwrap_or_else(|| DEFAULT_PROMPT.to_string()),
            request_timeout: secs(
                dispatch_file.request_timeout_secs,
                DEFAULT_REQUEST_TIMEOUT_SECS as f64,
            ),
        };
        let shutdown_grace = secs(
            dispatch_file.shutdown_grace_secs,
            DEFAULT_SHUTDOWN_GRACE_SECS,
        );

        let questions = file.questions.unwrap_or_default();
        let question_timeout = secs(
            questions.timeout_secs,
            DEFAULT_QUESTION_TIMEOUT_SECS as f64,
        );
        let question_poll = questions.poll_url.map(|url| PollerConfig {
            url,
            interval: Duration::from_millis(
                questions.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            ..PollerConfig::default()
        });

        let vlm_file = file.vlm.unwrap_or_default();
        let http_defaults = HttpBackendConfig::default();
        let vlm = VlmSettings {
            backend: vlm_file
                .backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            endpoint: vlm_file.endpoint.unwrap_or(http_defaults.endpoint),
            model: vlm_file.model.unwrap_or(http_defaults.model),
            api_key_env: vlm_file
                .api_key_env
                .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string()),
            max_images: vlm_file.max_images.unwrap_or(http_defaults.max_images),
            max_tokens: vlm_file.max_tokens.unwrap_or(http_defaults.max_tokens),
        };

        Self {
            source,
            buffer_capacity: buffer.capacity.unwrap_or(DEFAULT_BUFFER_FRAMES),
            full_buffer,
            segment,
            transform,
            dispatch,
            shutdown_grace,
            question_timeout,
            question_poll,
            vlm,
            results_path: file.results.and_then(|results| results.path),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("VLM_PIPELINE_SOURCE_URL") {
            if !url.trim().is_empty() {
                self.source.url = url;
            }
        }
        if let Ok(mode) = std::env::var("VLM_PIPELINE_MODE") {
            if !mode.trim().is_empty() {
                self.dispatch.mode = mode.parse()?;
            }
        }
        if let Ok(max) = std::env::var("VLM_PIPELINE_MAX_CONCURRENT") {
            self.dispatch.max_concurrent = max.trim().parse().map_err(|_| {
                anyhow!("VLM_PIPELINE_MAX_CONCURRENT must be a positive integer")
            })?;
        }
        if let Ok(timeout) = std::env::var("VLM_PIPELINE_QUESTION_TIMEOUT_SECS") {
            let seconds: f64 = timeout.trim().parse().map_err(|_| {
                anyhow!("VLM_PIPELINE_QUESTION_TIMEOUT_SECS must be a number of seconds")
            })?;
            if !seconds.is_finite() || seconds <= 0.0 {
                return Err(anyhow!(
                    "VLM_PIPELINE_QUESTION_TIMEOUT_SECS must be greater than zero"
                ));
            }
            self.question_timeout = Duration::try_from_secs_f64(seconds).map_err(|_| {
                anyhow!("VLM_PIPELINE_QUESTION_TIMEOUT_SECS {} is out of range", seconds)
            })?;
        }
        if let Ok(backend) = std::env::var("VLM_PIPELINE_BACKEND") {
            if !backend.trim().is_empty() {
                self.vlm.backend = backend.trim().to_string();
            }
        }
        if let Ok(endpoint) = std::env::var("VLM_PIPELINE_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                self.vlm.endpoint = endpoint;
            }
        }
        if let Ok(model) = std::env::var("VLM_PIPELINE_MODEL") {
            if !model.trim().is_empty() {
                self.vlm.model = model;
            }
        }
        if let Ok(path) = std::env::var("VLM_PIPELINE_RESULTS_PATH") {
            if !path.trim().is_empty() {
                self.results_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&mut self) -> Result<()> {
        self.normalize();
        if !self.segment.is_bounded() {
            return Err(anyhow!(
                "segment target duration and frame count are both disabled"
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(anyhow!("buffer capacity must be greater than zero"));
        }
        if self.dispatch.max_concurrent == 0 {
            return Err(anyhow!("max_concurrent must be at least 1"));
        }
        if self.dispatch.queue_depth == 0 {
            return Err(anyhow!("queue_depth must be at least 1"));
        }
        if self.dispatch.request_timeout.is_zero() {
            return Err(anyhow!("request timeout must be greater than zero"));
        }
        if self.question_timeout.is_zero() {
            return Err(anyhow!("question timeout must be greater than zero"));
        }
        let block_wait = match self.full_buffer {
            FullBufferPolicy::Block { max_wait } => Some(max_wait),
            FullBufferPolicy::DropOldest => None,
        };
        for (name, value) in [
            ("segment target_duration_secs", self.segment.target_duration),
            ("request_timeout_secs", Some(self.dispatch.request_timeout)),
            ("shutdown_grace_secs", Some(self.shutdown_grace)),
            ("question timeout_secs", Some(self.question_timeout)),
            ("buffer block_wait_ms", block_wait),
            ("question poll_interval_ms", self.question_poll.as_ref().map(|p| p.interval)),
        ] {
            if let Some(value) = value {
                if value > MAX_DURATION {
                    return Err(anyhow!(
                        "{} exceeds the maximum of {}s",
                        name,
                        MAX_DURATION.as_secs()
                    ));
                }
            }
        }
        if let Some(resize) = self.transform.resize {
            if resize.width == 0 || resize.height == 0 {
                return Err(anyhow!(
                    "resize target {}x{} must be non-zero",
                    resize.width,
                    resize.height
                ));
            }
        }
        if !(1..=100).contains(&self.transform.jpeg_quality) {
            return Err(anyhow!(
                "jpeg_quality {} outside 1..=100",
                self.transform.jpeg_quality
            ));
        }
        if self.source.target_fps == 0 {
            return Err(anyhow!("source target_fps must be greater than zero"));
        }
        if self.source.url.trim().is_empty() {
            return Err(anyhow!("source url must not be empty"));
        }
        if !KNOWN_BACKENDS.contains(&self.vlm.backend.as_str()) {
            return Err(anyhow!(
                "unknown vlm backend '{}'; expected one of {}",
                self.vlm.backend,
                KNOWN_BACKENDS.join(", ")
            ));
        }
        if self.vlm.max_images == 0 {
            return Err(anyhow!("vlm max_images must be greater than zero"));
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.vlm.backend = self.vlm.backend.trim().to_lowercase();
        self.dispatch.prompt = self.dispatch.prompt.trim().to_string();
        if self.dispatch.prompt.is_empty() {
            self.dispatch.prompt = DEFAULT_PROMPT.to_string();
        }
    }
}

/// Non-positive values map to zero and oversized ones to `Duration::MAX`;
/// `validate` rejects both.
fn secs(value: Option<f64>, default: f64) -> Duration {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => {
            Duration::try_from_secs_f64(v).unwrap_or(Duration::MAX)
        }
        Some(v) if v > 0.0 => Duration::MAX,
        Some(_) => Duration::ZERO,
        None => Duration::from_secs_f64(default),
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
