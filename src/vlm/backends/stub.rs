use anyhow::{anyhow, bail, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::vlm::backend::{AnalyzeRequest, VlmBackend, VlmResponse};
use crate::TaskId;

type FailurePredicate = Box<dyn Fn(&AnalyzeRequest<'_>) -> bool + Send + Sync>;

/// What the stub saw on one call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StubCall {
    pub task_id: TaskId,
    pub segment_id: u64,
    pub frames: usize,
    pub question: Option<String>,
}

/// Offline backend for tests and demos.
///
/// Produces a deterministic description of the segment, optionally after a
/// simulated latency, and fails the calls matched by a predicate.
pub struct StubBackend {
    latency: Duration,
    fail_when: Option<FailurePredicate>,
    calls: Mutex<Vec<StubCall>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            fail_when: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AnalyzeRequest<'_>) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    /// Calls received so far, in arrival order.
    pub fn calls(&self) -> Vec<StubCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VlmBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn analyze(&self, request: &AnalyzeRequest<'_>, cancel: &CancelToken) -> Result<VlmResponse> {
        let started = Instant::now();
        self.calls
            .lock()
            .map_err(|_| anyhow!("stub call log poisoned"))?
            .push(StubCall {
                task_id: request.task_id,
                segment_id: request.segment.id(),
                frames: request.segment.len(),
                question: request.question.map(str::to_string),
            });

        if !self.latency.is_zero() {
            let wait = self.latency.min(request.timeout);
            if cancel.sleep(wait) {
                bail!("cancelled");
            }
            if self.latency > request.timeout {
                bail!("timed out after {:.1}s", request.timeout.as_secs_f64());
            }
        }

        if let Some(predicate) = &self.fail_when {
            if predicate(request) {
                bail!("stub failure for task {}", request.task_id);
            }
        }

        let range = request.segment.range();
        let mut text = format!(
            "segment {}: {} frames, {:.1}s-{:.1}s, nothing unusual",
            request.segment.id(),
            request.segment.len(),
            range.start.as_secs_f64(),
            range.end.as_secs_f64()
        );
        if let Some(question) = request.question {
            text.push_str(&format!("; asked {:?}: no answer in stub mode", question));
        }
        Ok(VlmResponse {
            text,
            duration: started.elapsed(),
        })
    }
}
