//! Result sinks.
//!
//! The dispatcher hands every settled task to a [`ResultSink`]. Sinks decide
//! what to do with failures (alert, resubmit); the pipeline never retries.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::dispatch::InferenceOutcome;

/// Receives inference outcomes, possibly from several worker threads at once.
pub trait ResultSink: Send + Sync {
    fn deliver(&self, outcome: &InferenceOutcome) -> Result<()>;
}

/// Writes one log line per outcome.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn deliver(&self, outcome: &InferenceOutcome) -> Result<()> {
        let question = outcome
            .question
            .as_deref()
            .map(|q| format!(" question={:?}", q))
            .unwrap_or_default();
        match (&outcome.result_text, &outcome.error) {
            (Some(text), _) => log::info!(
                "[{} seg={} {:.1}-{:.1}s {:.2}s]{} {}",
                outcome.task_id,
                outcome.segment_id,
                outcome.start_secs,
                outcome.end_secs,
                outcome.duration_secs,
                question,
                text
            ),
            (None, error) => log::warn!(
                "[{} seg={} {:.1}-{:.1}s]{} failed: {}",
                outcome.task_id,
                outcome.segment_id,
                outcome.start_secs,
                outcome.end_secs,
                question,
                error.as_deref().unwrap_or("unknown error")
            ),
        }
        Ok(())
    }
}

/// Appends outcomes to a file as JSON lines.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create results directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open results file {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for JsonlSink {
    fn deliver(&self, outcome: &InferenceOutcome) -> Result<()> {
        let mut line = serde_json::to_string(outcome)?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow!("results file lock poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append to {}", self.path.display()))?;
        file.flush()?;
        Ok(())
    }
}

/// Keeps outcomes in memory in delivery order.
#[derive(Debug, Default)]
pub struct CollectorSink {
    outcomes: Mutex<Vec<InferenceOutcome>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<InferenceOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultSink for CollectorSink {
    fn deliver(&self, outcome: &InferenceOutcome) -> Result<()> {
        self.outcomes
            .lock()
            .map_err(|_| anyhow!("collector lock poisoned"))?
            .push(outcome.clone());
        Ok(())
    }
}

/// Delivers to every inner sink; one failing sink does not starve the others.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ResultSink for FanoutSink {
    fn deliver(&self, outcome: &InferenceOutcome) -> Result<()> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(outcome) {
                failures.push(format!("{:#}", e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} sink(s) failed: {}", failures.len(), failures.join("; ")))
        }
    }
}
