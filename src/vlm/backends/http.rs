//! OpenAI-compatible chat-completions backend.
//!
//! Frames are sent as base64 JPEG data URLs in a single user message. Long
//! segments are sampled evenly down to `max_images` frames, always keeping the
//! first and last frame.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::segment::EncodedFrame;
use crate::vlm::backend::{AnalyzeRequest, VlmBackend, VlmResponse};

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Clone, Debug)]
pub struct HttpBackendConfig {
    /// Full chat-completions URL, e.g. `https://host/v1/chat/completions`.
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_images: usize,
    pub max_tokens: u32,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000/v1/chat/completions".to_string(),
            model: "qwen2.5-vl-7b-instruct".to_string(),
            api_key: None,
            max_images: 8,
            max_tokens: 512,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

pub struct HttpBackend {
    config: HttpBackendConfig,
    agent: ureq::Agent,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self> {
        let url = url::Url::parse(&config.endpoint).context("parse vlm endpoint")?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported vlm endpoint scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        if config.max_images == 0 {
            return Err(anyhow!("max_images must be greater than zero"));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .build();
        Ok(Self { config, agent })
    }

    fn build_body(&self, request: &AnalyzeRequest<'_>) -> Value {
        let mut content = vec![json!({
            "type": "text",
            "text": request.full_prompt(),
        })];
        for frame in sample_frames(request.segment.frames(), self.config.max_images) {
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:image/jpeg;base64,{}", BASE64.encode(&frame.jpeg)),
                },
            }));
        }
        json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "messages": [{ "role": "user", "content": content }],
        })
    }
}

impl VlmBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn analyze(&self, request: &AnalyzeRequest<'_>, cancel: &CancelToken) -> Result<VlmResponse> {
        if cancel.is_cancelled() {
            bail!("cancelled before request");
        }
        let started = Instant::now();
        let body = serde_json::to_string(&self.build_body(request))?;

        let mut call = self
            .agent
            .post(&self.config.endpoint)
            .timeout(request.timeout)
            .set("Content-Type", "application/json");
        if let Some(key) = &self.config.api_key {
            call = call.set("Authorization", &format!("Bearer {}", key));
        }

        let response = match call.send_string(&body) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                let detail: String = detail.chars().take(MAX_ERROR_BODY_CHARS).collect();
                bail!("vlm endpoint returned {}: {}", code, detail);
            }
            Err(e) => return Err(anyhow!(e).context("vlm request failed")),
        };
        let raw = response.into_string().context("read vlm response")?;
        let text = parse_completion(&raw)?;
        Ok(VlmResponse {
            text,
            duration: started.elapsed(),
        })
    }
}

fn parse_completion(raw: &str) -> Result<String> {
    let parsed: ChatResponse =
        serde_json::from_str(raw).map_err(|e| anyhow!("invalid vlm response: {}", e))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| anyhow!("vlm response has no content"))
}

/// Evenly spaced subset of at most `max` frames, first and last included.
fn sample_frames(frames: &[EncodedFrame], max: usize) -> Vec<&EncodedFrame> {
    if frames.len() <= max || max == 0 {
        return frames.iter().collect();
    }
    if max == 1 {
        return frames.iter().take(1).collect();
    }
    let last = frames.len() - 1;
    (0..max)
        .map(|i| &frames[(i * last + (max - 1) / 2) / (max - 1)])
        .collect()
}
