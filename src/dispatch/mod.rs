//! Inference dispatch.
//!
//! Each dispatched segment becomes one task: it gets a task id, tries to claim
//! the pending question, waits for a concurrency slot, calls the VLM backend,
//! then settles the question claim and delivers an [`InferenceOutcome`] to the
//! result sink and to the caller's [`PendingResult`].
//!
//! In `Sync` mode the task runs on the calling thread. In `Async` mode it is
//! queued to a pool of `max_concurrent` workers and `dispatch` returns at once.
//! The queue holds at most `queue_depth` waiting tasks; a segment dispatched
//! into a full queue fails immediately and any question it claimed goes back
//! to the registry.

mod semaphore;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use self::semaphore::Semaphore;
use crate::cancel::CancelToken;
use crate::question::QuestionRegistry;
use crate::segment::Segment;
use crate::sink::ResultSink;
use crate::vlm::{AnalyzeRequest, VlmBackend};
use crate::TaskId;

pub const DEFAULT_MAX_CONCURRENT: usize = 2;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_QUEUE_DEPTH: usize = 8;
pub const DEFAULT_PROMPT: &str =
    "These are consecutive frames from a live camera. Describe what happens in the scene.";

const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// `dispatch` blocks until the VLM call completes.
    Sync,
    /// `dispatch` queues the task and returns immediately.
    #[default]
    Async,
}

impl std::str::FromStr for DispatchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" | "synchronous" => Ok(DispatchMode::Sync),
            "async" | "asynchronous" => Ok(DispatchMode::Async),
            other => Err(anyhow!("unknown dispatch mode '{}'; expected sync|async", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Queued,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }
}

/// Task state shared between the running task and its `PendingResult`.
#[derive(Clone, Default)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn set(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub mode: DispatchMode,
    pub max_concurrent: usize,
    /// Tasks that may wait for a worker in async mode.
    pub queue_depth: usize,
    pub prompt: String,
    pub request_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            prompt: DEFAULT_PROMPT.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Result of one inference task, as delivered to the sink.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InferenceOutcome {
    pub task_id: TaskId,
    pub segment_id: u64,
    pub start_secs: f64,
    pub end_secs: f64,
    pub frame_count: usize,
    pub dropped_frames: usize,
    pub question: Option<String>,
    pub result_text: Option<String>,
    pub error: Option<String>,
    pub duration_secs: f64,
    pub state: TaskState,
}

impl InferenceOutcome {
    pub fn is_success(&self) -> bool {
        self.state == TaskState::Completed
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub running: u64,
    /// Tasks failed because the async queue was full.
    pub rejected: u64,
    pub questions_answered: u64,
    pub protocol_violations: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    questions_answered: AtomicU64,
    protocol_violations: AtomicU64,
}

impl Counters {
    fn in_flight(&self) -> u64 {
        let settled =
            self.completed.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst);
        self.dispatched.load(Ordering::SeqCst).saturating_sub(settled)
    }
}

/// Handle to the outcome of one dispatched task.
pub struct PendingResult {
    task_id: TaskId,
    segment_id: u64,
    state: StateCell,
    rx: Receiver<InferenceOutcome>,
}

impl PendingResult {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    /// Block until the task settles.
    pub fn wait(self) -> Result<InferenceOutcome> {
        self.rx
            .recv()
            .map_err(|_| anyhow!("task {} ended without an outcome", self.task_id))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<InferenceOutcome>> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("task {} ended without an outcome", self.task_id))
            }
        }
    }

    /// Non-blocking poll. `Ok(None)` while the task is still queued or running.
    pub fn try_result(&self) -> Result<Option<InferenceOutcome>> {
        match self.rx.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                Err(anyhow!("task {} ended without an outcome", self.task_id))
            }
        }
    }
}

struct Task {
    id: TaskId,
    segment: Segment,
    question: Option<String>,
    queued_at: Instant,
    state: StateCell,
    reply: Sender<InferenceOutcome>,
}

/// State shared by the dispatching thread and every worker.
struct TaskRunner {
    backend: Arc<dyn VlmBackend>,
    questions: Arc<QuestionRegistry>,
    sink: Arc<dyn ResultSink>,
    semaphore: Semaphore,
    cancel: CancelToken,
    prompt: String,
    request_timeout: Duration,
    counters: Counters,
}

impl TaskRunner {
    fn run(&self, task: Task) {
        let started = Instant::now();
        let result = self.call_backend(&task);
        let duration = started.elapsed();
        self.finish(task, result, duration);
    }

    /// Settle a task that never reached the backend.
    fn reject(&self, task: Task, reason: &str) {
        self.finish(task, Err(anyhow!("{}", reason)), Duration::ZERO);
    }

    fn finish(&self, task: Task, result: Result<String>, duration: Duration) {
        let outcome = match result {
            Ok(text) => self.settle(&task, Ok(text), duration),
            Err(e) => {
                log::warn!(
                    "task {} (segment {}) failed after {:.2}s: {:#}",
                    task.id,
                    task.segment.id(),
                    duration.as_secs_f64(),
                    e
                );
                self.settle(&task, Err(format!("{:#}", e)), duration)
            }
        };

        if let Err(e) = self.sink.deliver(&outcome) {
            log::warn!("result sink rejected task {}: {:#}", task.id, e);
        }
        // The caller may have dropped its handle; that is fine.
        let _ = task.reply.send(outcome);
    }

    fn call_backend(&self, task: &Task) -> Result<String> {
        if self.cancel.is_cancelled() {
            bail!("cancelled before start");
        }
        let Some(_permit) = self.semaphore.acquire(&self.cancel) else {
            bail!("cancelled while waiting for a slot");
        };
        task.state.set(TaskState::Running);
        log::debug!(
            "task {} running segment {} ({} frames, queued {:.2}s)",
            task.id,
            task.segment.id(),
            task.segment.len(),
            task.queued_at.elapsed().as_secs_f64()
        );

        let request = AnalyzeRequest {
            task_id: task.id,
            segment: &task.segment,
            prompt: &self.prompt,
            question: task.question.as_deref(),
            timeout: self.request_timeout,
        };
        let response = catch_unwind(AssertUnwindSafe(|| {
            self.backend.analyze(&request, &self.cancel)
        }))
        .map_err(|_| anyhow!("backend '{}' panicked", self.backend.name()))??;
        Ok(response.text)
    }

    fn settle(
        &self,
        task: &Task,
        result: std::result::Result<String, String>,
        duration: Duration,
    ) -> InferenceOutcome {
        let success = result.is_ok();
        if task.question.is_some() {
            match self.questions.release(task.id, success) {
                Ok(()) if success => {
                    self.counters.questions_answered.fetch_add(1, Ordering::SeqCst);
                }
                Ok(()) => {}
                Err(_) => {
                    self.counters
                        .protocol_violations
                        .fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        let counter = if success {
            &self.counters.completed
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        let state = if success {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        task.state.set(state);

        let range = task.segment.range();
        let (result_text, error) = match result {
            Ok(text) => (Some(text), None),
            Err(reason) => (None, Some(reason)),
        };
        InferenceOutcome {
            task_id: task.id,
            segment_id: task.segment.id(),
            start_secs: range.start.as_secs_f64(),
            end_secs: range.end.as_secs_f64(),
            frame_count: task.segment.len(),
            dropped_frames: task.segment.dropped().len(),
            question: task.question.clone(),
            result_text,
            error,
            duration_secs: duration.as_secs_f64(),
            state,
        }
    }
}

pub struct InferenceDispatcher {
    mode: DispatchMode,
    runner: Arc<TaskRunner>,
    next_task: AtomicU64,
    accepting: AtomicBool,
    jobs: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl InferenceDispatcher {
    pub fn new(
        config: DispatcherConfig,
        backend: Arc<dyn VlmBackend>,
        questions: Arc<QuestionRegistry>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        if config.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if config.request_timeout.is_zero() {
            bail!("request timeout must be greater than zero");
        }
        if config.queue_depth == 0 {
            bail!("queue_depth must be at least 1");
        }

        let runner = Arc::new(TaskRunner {
            backend,
            questions,
            sink,
            semaphore: Semaphore::new(config.max_concurrent),
            cancel: CancelToken::new(),
            prompt: config.prompt,
            request_timeout: config.request_timeout,
            counters: Counters::default(),
        });

        let mut workers = Vec::new();
        let mut jobs = None;
        if config.mode == DispatchMode::Async {
            let (tx, rx) = crossbeam_channel::bounded::<Task>(config.queue_depth);
            for i in 0..config.max_concurrent {
                let rx = rx.clone();
                let runner = Arc::clone(&runner);
                let handle = std::thread::Builder::new()
                    .name(format!("vlm-worker-{}", i))
                    .spawn(move || {
                        for task in rx.iter() {
                            runner.run(task);
                        }
                    })
                    .context("spawn inference worker")?;
                workers.push(handle);
            }
            jobs = Some(tx);
        }

        log::info!(
            "dispatcher ready: mode={:?} max_concurrent={} queue_depth={} backend={}",
            config.mode,
            config.max_concurrent,
            config.queue_depth,
            runner.backend.name()
        );
        Ok(Self {
            mode: config.mode,
            runner,
            next_task: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            jobs: Mutex::new(jobs),
            workers: Mutex::new(workers),
        })
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Submit a segment for inference.
    ///
    /// The question claim happens here, on the calling thread, so claims
    /// follow segment submission order.
    pub fn dispatch(&self, segment: Segment) -> Result<PendingResult> {
        if !self.accepting.load(Ordering::SeqCst) {
            bail!("dispatcher is shut down");
        }

        let assignment = self.runner.questions.try_pre_assign();
        let id = TaskId(self.next_task.fetch_add(1, Ordering::SeqCst));
        let question = assignment
            .and_then(|assignment| self.runner.questions.acquire(assignment, id))
            .map(|claimed| claimed.text);

        let (reply, rx) = crossbeam_channel::bounded(1);
        let state = StateCell::default();
        let pending = PendingResult {
            task_id: id,
            segment_id: segment.id(),
            state: state.clone(),
            rx,
        };
        let task = Task {
            id,
            segment,
            question,
            queued_at: Instant::now(),
            state,
            reply,
        };
        self.runner.counters.dispatched.fetch_add(1, Ordering::SeqCst);

        match self.mode {
            DispatchMode::Sync => self.runner.run(task),
            DispatchMode::Async => {
                let sender = self
                    .jobs
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                match sender {
                    Some(sender) => match sender.try_send(task) {
                        Ok(()) => {}
                        Err(TrySendError::Full(task)) => {
                            self.runner.counters.rejected.fetch_add(1, Ordering::SeqCst);
                            log::warn!(
                                "inference backlog full; segment {} not analyzed",
                                task.segment.id()
                            );
                            self.runner.reject(task, "inference backlog full");
                        }
                        // Workers are gone; settle here so the claim rolls back.
                        Err(TrySendError::Disconnected(task)) => self.runner.run(task),
                    },
                    None => self.runner.run(task),
                }
            }
        }
        Ok(pending)
    }

    pub fn stats(&self) -> DispatchStats {
        let counters = &self.runner.counters;
        DispatchStats {
            dispatched: counters.dispatched.load(Ordering::SeqCst),
            completed: counters.completed.load(Ordering::SeqCst),
            failed: counters.failed.load(Ordering::SeqCst),
            in_flight: counters.in_flight(),
            running: self.runner.semaphore.in_use() as u64,
            rejected: counters.rejected.load(Ordering::SeqCst),
            questions_answered: counters.questions_answered.load(Ordering::SeqCst),
            protocol_violations: counters.protocol_violations.load(Ordering::SeqCst),
        }
    }

    /// Token tripped by `shutdown` once the grace period runs out.
    pub fn cancel_token(&self) -> CancelToken {
        self.runner.cancel.clone()
    }

    /// Stop accepting work, let queued and running tasks finish within
    /// `grace`, then cancel whatever is left and join the workers.
    ///
    /// Returns true if everything drained before the deadline.
    pub fn shutdown(&self, grace: Duration) -> bool {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return true;
        }
        // Closing the channel lets workers exit once the queue is empty.
        drop(
            self.jobs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );

        let deadline = Instant::now() + grace;
        while self.runner.counters.in_flight() > 0 && Instant::now() < deadline {
            std::thread::sleep(DRAIN_POLL);
        }
        let drained = self.runner.counters.in_flight() == 0;
        if !drained {
            log::warn!(
                "grace period of {:.1}s elapsed with {} task(s) in flight; cancelling",
                grace.as_secs_f64(),
                self.runner.counters.in_flight()
            );
        }
        self.runner.cancel.cancel();

        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in workers {
            if handle.join().is_err() {
                log::error!("inference worker panicked");
            }
        }
        let stats = self.stats();
        log::info!(
            "dispatcher stopped: dispatched={} completed={} failed={}",
            stats.dispatched,
            stats.completed,
            stats.failed
        );
        drained
    }
}

impl Drop for InferenceDispatcher {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::tests_support::segment_with_frames;
    use crate::sink::CollectorSink;
    use crate::vlm::StubBackend;

    fn dispatcher(
        mode: DispatchMode,
        max_concurrent: usize,
        backend: Arc<StubBackend>,
        questions: Arc<QuestionRegistry>,
        sink: Arc<CollectorSink>,
    ) -> InferenceDispatcher {
        InferenceDispatcher::new(
            DispatcherConfig {
                mode,
                max_concurrent,
                request_timeout: Duration::from_secs(5),
                ..DispatcherConfig::default()
            },
            backend,
            questions,
            sink,
        )
        .unwrap()
    }

    #[test]
    fn sync_dispatch_is_complete_on_return() {
        let backend = Arc::new(StubBackend::new());
        let sink = Arc::new(CollectorSink::new());
        let questions = Arc::new(QuestionRegistry::default());
        let dispatcher = dispatcher(
            DispatchMode::Sync,
            1,
            backend,
            Arc::clone(&questions),
            Arc::clone(&sink),
        );

        let pending = dispatcher.dispatch(segment_with_frames(4, 3)).unwrap();
        let outcome = pending.try_result().unwrap().expect("ready in sync mode");
        assert!(outcome.is_success());
        assert_eq!(outcome.segment_id, 4);
        assert_eq!(outcome.frame_count, 3);
        assert_eq!(sink.outcomes().len(), 1);
    }

    #[test]
    fn claimed_question_is_consumed_on_success() {
        let backend = Arc::new(StubBackend::new());
        let sink = Arc::new(CollectorSink::new());
        let questions = Arc::new(QuestionRegistry::default());
        questions.publish("is the gate open?").unwrap();
        let dispatcher = dispatcher(
            DispatchMode::Sync,
            1,
            Arc::clone(&backend),
            Arc::clone(&questions),
            sink,
        );

        let first = dispatcher.dispatch(segment_with_frames(0, 1)).unwrap().wait().unwrap();
        let second = dispatcher.dispatch(segment_with_frames(1, 1)).unwrap().wait().unwrap();
        assert_eq!(first.question.as_deref(), Some("is the gate open?"));
        assert!(second.question.is_none());
        assert_eq!(questions.state(), crate::question::AssignmentState::Empty);
        assert_eq!(dispatcher.stats().questions_answered, 1);
    }

    #[test]
    fn failed_task_returns_question_to_pool() {
        let backend = Arc::new(StubBackend::new().failing_when(|r| r.segment.id() == 0));
        let sink = Arc::new(CollectorSink::new());
        let questions = Arc::new(QuestionRegistry::default());
        questions.publish("count the people").unwrap();
        let dispatcher = dispatcher(
            DispatchMode::Sync,
            1,
            backend,
            Arc::clone(&questions),
            sink,
        );

        let failed = dispatcher.dispatch(segment_with_frames(0, 1)).unwrap().wait().unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.error.as_deref().unwrap().contains("stub failure"));
        assert_eq!(questions.state(), crate::question::AssignmentState::Available);

        let retry = dispatcher.dispatch(segment_with_frames(1, 1)).unwrap().wait().unwrap();
        assert!(retry.is_success());
        assert_eq!(retry.question.as_deref(), Some("count the people"));
    }

    #[test]
    fn async_mode_bounds_concurrency_and_returns_immediately() {
        let backend = Arc::new(StubBackend::new().with_latency(Duration::from_millis(50)));
        let sink = Arc::new(CollectorSink::new());
        let dispatcher = dispatcher(
            DispatchMode::Async,
            2,
            Arc::clone(&backend),
            Arc::new(QuestionRegistry::default()),
            Arc::clone(&sink),
        );

        let started = Instant::now();
        let pending: Vec<PendingResult> = (0..6)
            .map(|i| dispatcher.dispatch(segment_with_frames(i, 2)).unwrap())
            .collect();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(dispatcher.stats().running <= 2);

        let mut ids: Vec<u64> = pending
            .into_iter()
            .map(|p| p.wait().unwrap().segment_id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
        // Six 50ms calls on two slots take at least three rounds.
        assert!(started.elapsed() >= Duration::from_millis(140));
        assert_eq!(sink.outcomes().len(), 6);
        assert_eq!(dispatcher.stats().in_flight, 0);
    }

    #[test]
    fn shutdown_cancels_after_grace() {
        let backend = Arc::new(StubBackend::new().with_latency(Duration::from_secs(3)));
        let sink = Arc::new(CollectorSink::new());
        let questions = Arc::new(QuestionRegistry::default());
        questions.publish("anything moving?").unwrap();
        let dispatcher = dispatcher(
            DispatchMode::Async,
            1,
            backend,
            Arc::clone(&questions),
            Arc::clone(&sink),
        );

        let running = dispatcher.dispatch(segment_with_frames(0, 1)).unwrap();
        let queued = dispatcher.dispatch(segment_with_frames(1, 1)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(running.state(), TaskState::Running);
        assert_eq!(queued.state(), TaskState::Queued);
        let started = Instant::now();
        assert!(!dispatcher.shutdown(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(2));

        let running = running.wait().unwrap();
        let queued = queued.wait().unwrap();
        assert_eq!(running.state, TaskState::Failed);
        assert_eq!(queued.state, TaskState::Failed);
        assert_eq!(running.question.as_deref(), Some("anything moving?"));
        // The failed claim rolled back rather than leaking.
        assert_eq!(questions.state(), crate::question::AssignmentState::Available);
        assert!(dispatcher.dispatch(segment_with_frames(2, 1)).is_err());
        // Second shutdown is a no-op.
        assert!(dispatcher.shutdown(Duration::ZERO));
    }

    #[test]
    fn full_backlog_fails_fast_and_returns_question() {
        let backend = Arc::new(StubBackend::new().with_latency(Duration::from_millis(300)));
        let sink = Arc::new(CollectorSink::new());
        let questions = Arc::new(QuestionRegistry::default());
        let dispatcher = InferenceDispatcher::new(
            DispatcherConfig {
                mode: DispatchMode::Async,
                max_concurrent: 1,
                queue_depth: 1,
                request_timeout: Duration::from_secs(5),
                ..DispatcherConfig::default()
            },
            Arc::clone(&backend) as Arc<dyn VlmBackend>,
            Arc::clone(&questions),
            Arc::clone(&sink) as Arc<dyn ResultSink>,
        )
        .unwrap();

        let running = dispatcher.dispatch(segment_with_frames(0, 1)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while running.state() != TaskState::Running && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(running.state(), TaskState::Running);
        let queued = dispatcher.dispatch(segment_with_frames(1, 1)).unwrap();

        questions.publish("who rang the bell?").unwrap();
        let overflow = dispatcher.dispatch(segment_with_frames(2, 1)).unwrap();
        let outcome = overflow.try_result().unwrap().expect("settled on dispatch");
        assert_eq!(outcome.state, TaskState::Failed);
        assert_eq!(outcome.question.as_deref(), Some("who rang the bell?"));
        assert!(outcome.error.as_deref().unwrap().contains("backlog full"));
        assert_eq!(questions.state(), crate::question::AssignmentState::Available);
        assert_eq!(dispatcher.stats().rejected, 1);

        assert!(running.wait().unwrap().is_success());
        let queued = queued.wait().unwrap();
        assert!(queued.is_success());
        assert!(queued.question.is_none());
        assert_eq!(backend.calls().len(), 2);
        assert_eq!(sink.outcomes().len(), 3);
    }

    #[test]
    fn parses_modes() {
        assert_eq!("SYNC".parse::<DispatchMode>().unwrap(), DispatchMode::Sync);
        assert_eq!(" async ".parse::<DispatchMode>().unwrap(), DispatchMode::Async);
        assert!("batch".parse::<DispatchMode>().is_err());
    }
}
