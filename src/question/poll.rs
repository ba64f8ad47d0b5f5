//! HTTP question publisher.
//!
//! Polls a speech-recognition service for the user's pending question and
//! publishes it into the [`QuestionRegistry`]. The endpoint answers with
//! `{"question": "..."}`, `{"question": null}`, or `204 No Content`.
//!
//! A fetched question that is rejected because the slot is busy is held back
//! and offered again on the next poll, so it is never lost to a busy slot.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{PublishRejected, QuestionRegistry};
use crate::cancel::CancelToken;

#[derive(Clone, Debug)]
pub struct PollerConfig {
    pub url: String,
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8765/question".to_string(),
            interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuestionBody {
    question: Option<String>,
}

pub struct QuestionPoller {
    config: PollerConfig,
    registry: Arc<QuestionRegistry>,
    cancel: CancelToken,
}

impl QuestionPoller {
    pub fn new(
        config: PollerConfig,
        registry: Arc<QuestionRegistry>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let url = url::Url::parse(&config.url).context("parse question poll url")?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported question poll scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        Ok(Self {
            config,
            registry,
            cancel,
        })
    }

    /// Run the poll loop on a background thread until the token is cancelled.
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }

    fn run(self) {
        let agent = ureq::AgentBuilder::new()
            .timeout(self.config.request_timeout)
            .build();
        let mut pending: Option<String> = None;
        log::info!("polling questions from {}", self.config.url);

        while !self.cancel.is_cancelled() {
            if pending.is_none() {
                match fetch_question(&agent, &self.config.url) {
                    Ok(question) => pending = question,
                    Err(e) => log::debug!("question poll failed: {:#}", e),
                }
            }
            offer(&self.registry, &mut pending);
            if self.cancel.sleep(self.config.interval) {
                break;
            }
        }
        if let Some(text) = pending {
            log::warn!("question poller stopped with unpublished question {:?}", text);
        }
    }
}

fn fetch_question(agent: &ureq::Agent, url: &str) -> Result<Option<String>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch question from {}", url))?;
    if response.status() == 204 {
        return Ok(None);
    }
    let body = response.into_string().context("read question body")?;
    parse_question(&body)
}

fn parse_question(body: &str) -> Result<Option<String>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let parsed: QuestionBody =
        serde_json::from_str(body).map_err(|e| anyhow!("invalid question body: {}", e))?;
    Ok(parsed
        .question
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty()))
}

/// Try to publish the held question. Keeps it when the slot is busy.
fn offer(registry: &QuestionRegistry, pending: &mut Option<String>) {
    let Some(text) = pending.take() else {
        return;
    };
    match registry.publish(text.clone()) {
        Ok(()) => {}
        Err(PublishRejected::SlotBusy(state)) => {
            log::debug!("question slot busy ({:?}), holding {:?}", state, text);
            *pending = Some(text);
        }
        Err(PublishRejected::BlankQuestion) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskId;

    #[test]
    fn parses_question_bodies() {
        assert_eq!(
            parse_question(r#"{"question": " find the red car "}"#).unwrap(),
            Some("find the red car".to_string())
        );
        assert_eq!(parse_question(r#"{"question": null}"#).unwrap(), None);
        assert_eq!(parse_question(r#"{"question": "  "}"#).unwrap(), None);
        assert_eq!(parse_question("").unwrap(), None);
        assert!(parse_question("not json").is_err());
    }

    #[test]
    fn busy_slot_keeps_question_pending() {
        let registry = QuestionRegistry::new(Duration::from_secs(60));
        registry.publish("first").unwrap();
        registry.claim(TaskId(1)).unwrap();

        let mut pending = Some("second".to_string());
        offer(&registry, &mut pending);
        assert_eq!(pending.as_deref(), Some("second"));

        registry.release(TaskId(1), true).unwrap();
        offer(&registry, &mut pending);
        assert!(pending.is_none());
        assert_eq!(registry.status().text.as_deref(), Some("second"));
    }

    #[test]
    fn rejects_non_http_urls() {
        let registry = Arc::new(QuestionRegistry::default());
        let config = PollerConfig {
            url: "udp://127.0.0.1:9000".to_string(),
            ..PollerConfig::default()
        };
        assert!(QuestionPoller::new(config, registry, CancelToken::new()).is_err());
    }
}
