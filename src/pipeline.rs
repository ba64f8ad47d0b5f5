//! Pipeline lifecycle.
//!
//! `PipelineController` wires the ingestor, segment builder and dispatcher
//! together and owns the segmenting thread between `start()` and `stop()`.
//! The question registry outlives individual runs so publishers can hold on
//! to it; it is cleared on every stop.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::PipelineSettings;
use crate::dispatch::{DispatchStats, InferenceDispatcher};
use crate::frame::{FrameIngestor, IngestStats, Pop};
use crate::question::{QuestionRegistry, QuestionStatus};
use crate::segment::{SegmentBuilder, SegmentStats};
use crate::sink::ResultSink;
use crate::vlm::VlmBackend;

/// How long the segmenting thread waits for a frame before housekeeping.
const IDLE_POLL: Duration = Duration::from_millis(200);
const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerError {
    AlreadyRunning,
    NotRunning,
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::AlreadyRunning => write!(f, "pipeline is already running"),
            ControllerError::NotRunning => write!(f, "pipeline is not running"),
        }
    }
}

impl std::error::Error for ControllerError {}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub ingest: Option<IngestStats>,
    pub segments: SegmentStats,
    pub dispatch: Option<DispatchStats>,
    pub question: QuestionStatus,
}

struct Running {
    ingestor: FrameIngestor,
    dispatcher: Arc<InferenceDispatcher>,
    segmenter: JoinHandle<()>,
}

pub struct PipelineController {
    settings: PipelineSettings,
    backend: Arc<dyn VlmBackend>,
    sink: Arc<dyn ResultSink>,
    questions: Arc<QuestionRegistry>,
    segment_stats: Arc<Mutex<SegmentStats>>,
    running: Mutex<Option<Running>>,
}

impl PipelineController {
    pub fn new(
        settings: PipelineSettings,
        backend: Arc<dyn VlmBackend>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let questions = Arc::new(QuestionRegistry::new(settings.question_timeout));
        Self {
            settings,
            backend,
            sink,
            questions,
            segment_stats: Arc::new(Mutex::new(SegmentStats::default())),
            running: Mutex::new(None),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate settings and start the ingestion-to-dispatch chain.
    ///
    /// Fails with [`ControllerError::AlreadyRunning`] if already started.
    /// Any other error leaves the pipeline stopped.
    pub fn start(&self) -> Result<()> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(ControllerError::AlreadyRunning.into());
        }

        let mut settings = self.settings.clone();
        settings.validate().context("invalid pipeline settings")?;
        self.backend
            .warm_up()
            .with_context(|| format!("warm up vlm backend '{}'", self.backend.name()))?;

        let ingestor = FrameIngestor::new(settings.buffer_capacity, settings.full_buffer);
        let dispatcher = Arc::new(InferenceDispatcher::new(
            settings.dispatch.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.questions),
            Arc::clone(&self.sink),
        )?);
        let builder = SegmentBuilder::new(settings.segment, settings.transform);

        let segmenter = {
            let ingestor = ingestor.clone();
            let dispatcher = Arc::clone(&dispatcher);
            let questions = Arc::clone(&self.questions);
            let stats = Arc::clone(&self.segment_stats);
            std::thread::Builder::new()
                .name("segmenter".to_string())
                .spawn(move || run_segmenter(ingestor, builder, &dispatcher, &questions, &stats))
                .context("spawn segmenting thread")?
        };

        log::info!(
            "pipeline started: segment={:?} buffer={} mode={:?} max_concurrent={}",
            settings.segment,
            settings.buffer_capacity,
            settings.dispatch.mode,
            settings.dispatch.max_concurrent
        );
        *running = Some(Running {
            ingestor,
            dispatcher,
            segmenter,
        });
        Ok(())
    }

    /// Drain and stop. Waits up to the configured grace period for in-flight
    /// inference, then cancels it. Returns true if everything drained in time.
    /// A no-op when already stopped.
    pub fn stop(&self) -> bool {
        let Some(run) = self.lock_running().take() else {
            return true;
        };
        let deadline = Instant::now() + self.settings.shutdown_grace;
        run.ingestor.close();

        // Sync mode runs VLM calls on the segmenting thread, so the grace
        // period covers its drain too.
        while !run.segmenter.is_finished() && Instant::now() < deadline {
            std::thread::sleep(JOIN_POLL);
        }
        if !run.segmenter.is_finished() {
            log::warn!("segmenter still busy at grace deadline; cancelling inference");
            run.dispatcher.cancel_token().cancel();
        }
        if run.segmenter.join().is_err() {
            log::error!("segmenting thread panicked");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let drained = run.dispatcher.shutdown(remaining);
        if let Some(text) = self.questions.clear() {
            log::info!("discarded pending question on stop: {:?}", text);
        }
        log::info!("pipeline stopped");
        drained
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Producer handle for the current run.
    pub fn ingestor(&self) -> Result<FrameIngestor, ControllerError> {
        self.lock_running()
            .as_ref()
            .map(|run| run.ingestor.clone())
            .ok_or(ControllerError::NotRunning)
    }

    /// Publisher handle. Valid across runs.
    pub fn questions(&self) -> Arc<QuestionRegistry> {
        Arc::clone(&self.questions)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn status(&self) -> PipelineStatus {
        let running = self.lock_running();
        let segments = *self
            .segment_stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        PipelineStatus {
            running: running.is_some(),
            ingest: running.as_ref().map(|run| run.ingestor.stats()),
            segments,
            dispatch: running.as_ref().map(|run| run.dispatcher.stats()),
            question: self.questions.status(),
        }
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_segmenter(
    ingestor: FrameIngestor,
    mut builder: SegmentBuilder,
    dispatcher: &InferenceDispatcher,
    questions: &QuestionRegistry,
    stats: &Mutex<SegmentStats>,
) {
    let dispatch_all = |segments: Vec<crate::segment::Segment>| {
        for segment in segments {
            log::debug!(
                "segment {} ready: {} frames, {:.2}s-{:.2}s",
                segment.id(),
                segment.len(),
                segment.range().start.as_secs_f64(),
                segment.range().end.as_secs_f64()
            );
            if let Err(e) = dispatcher.dispatch(segment) {
                log::warn!("segment not dispatched: {:#}", e);
            }
        }
    };

    loop {
        match ingestor.pop_timeout(IDLE_POLL) {
            Pop::Frame(frame) => dispatch_all(builder.push(frame)),
            Pop::Empty => {
                questions.expire_stale();
            }
            Pop::Closed => {
                dispatch_all(builder.flush().into_iter().collect());
                break;
            }
        }
        *stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = builder.stats();
    }
    *stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = builder.stats();
}
