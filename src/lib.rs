//! VLM Video Pipeline
//!
//! Turns a live camera stream into a sequence of vision-language-model
//! inference results, and lets an external speaker attach a question to the
//! next segment the pipeline analyzes.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> FrameIngestor -> SegmentBuilder -> InferenceDispatcher -> ResultSink
//!                                                       ^
//!                                  QuestionRegistry ----+
//! ```
//!
//! Two guarantees hold by construction:
//!
//! 1. **Bounded memory**: the ingest buffer is fixed-capacity, segments are
//!    closed by duration or frame count, and the async inference queue holds
//!    at most `queue_depth` segments.
//! 2. **Single claim**: a published question is handed to at most one
//!    inference task at a time, and returns to the pool if that task fails.
//!
//! # Module Structure
//!
//! - `frame`: captured images and the bounded ingest buffer
//! - `segment`: segment assembly and per-frame encoding
//! - `question`: the question slot and its HTTP poller
//! - `dispatch`: task ids, worker pool and result handles
//! - `vlm`: model backends (HTTP, stub)
//! - `ingest`: camera sources feeding the ingestor
//! - `sink`: where finished results go
//! - `pipeline`: lifecycle wiring (`start`/`stop`)
//! - `config`: settings file and environment overrides

use serde::Serialize;

pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod question;
pub mod segment;
pub mod sink;
pub mod vlm;

pub use cancel::CancelToken;
pub use config::PipelineSettings;
pub use dispatch::{
    DispatchMode, DispatchStats, InferenceDispatcher, InferenceOutcome, PendingResult, TaskState,
};
pub use frame::{
    Frame, FrameIngestor, FullBufferPolicy, IngestClosed, IngestStats, PixelFormat, Pop, RawImage,
    SubmitOutcome,
};
pub use ingest::{CapturedImage, FrameSource, MjpegSource, SyntheticSource};
pub use pipeline::{ControllerError, PipelineController, PipelineStatus};
pub use question::{
    AssignmentState, ClaimedQuestion, PublishRejected, QuestionPoller, QuestionRegistry,
    QuestionStatus, RegistryError,
};
pub use segment::{
    DropReason, EncodedFrame, FrameTransform, ResizeTarget, Segment, SegmentBuilder,
    SegmentPolicy, SegmentStats,
};
pub use sink::{CollectorSink, FanoutSink, JsonlSink, LogSink, ResultSink};
pub use vlm::{BackendRegistry, HttpBackend, HttpBackendConfig, StubBackend, VlmBackend};

/// Identifier of one inference task. Unique and increasing per dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}
