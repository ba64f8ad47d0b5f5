//! vlm-watch - live camera analysis with a vision-language model
//!
//! This binary:
//! 1. Captures frames from a `stub://` or `http(s)://` MJPEG source
//! 2. Cuts them into bounded segments and sends each to the VLM backend
//! 3. Lets the user attach a question (stdin line or HTTP poller) to the
//!    next analyzed segment
//! 4. Writes results to the log and, optionally, a JSONL file

use anyhow::{Context, Result};
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vlm_pipeline::config::PipelineSettings;
use vlm_pipeline::ingest::{open_source, spawn_capture, SourceConfig};
use vlm_pipeline::{
    BackendRegistry, CancelToken, DispatchMode, FanoutSink, HttpBackend, JsonlSink, LogSink,
    PipelineController, PublishRejected, QuestionPoller, QuestionRegistry, ResultSink,
    StubBackend,
};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);
const STUB_LATENCY: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "VLM_PIPELINE_CONFIG")]
    config: Option<PathBuf>,
    /// Frame source URL (stub://name or http(s)://host/stream).
    #[arg(long)]
    source: Option<String>,
    /// Dispatch mode: sync or async.
    #[arg(long)]
    mode: Option<DispatchMode>,
    /// Maximum concurrent VLM calls.
    #[arg(long)]
    max_concurrent: Option<usize>,
    /// VLM backend name (stub, http).
    #[arg(long)]
    backend: Option<String>,
    /// Append results as JSON lines to this file.
    #[arg(long)]
    results: Option<PathBuf>,
    /// Question to publish at startup.
    #[arg(long)]
    question: Option<String>,
    /// Do not read questions from stdin.
    #[arg(long)]
    no_stdin: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => PipelineSettings::load_from(path)?,
        None => PipelineSettings::load()?,
    };
    apply_args(&mut settings, &args);
    settings.validate()?;

    let backend = build_backends(&settings)?.select(Some(&settings.vlm.backend))?;
    let sink = build_sink(&settings)?;

    let pipeline = PipelineController::new(settings.clone(), backend, sink);
    pipeline.start()?;

    let cancel = CancelToken::new();
    let ctrlc_cancel = cancel.clone();
    ctrlc::set_handler(move || ctrlc_cancel.cancel()).context("set Ctrl-C handler")?;

    let source = open_source(SourceConfig {
        url: settings.source.url.clone(),
        target_fps: settings.source.target_fps,
        width: settings.source.width,
        height: settings.source.height,
    })?;
    let capture = spawn_capture(source, pipeline.ingestor()?, cancel.clone())?;

    let questions = pipeline.questions();
    if let Some(question) = &args.question {
        publish(&questions, question);
    }
    let poller = match settings.question_poll.clone() {
        Some(poll) => Some(QuestionPoller::new(poll, Arc::clone(&questions), cancel.clone())?.spawn()),
        None => None,
    };
    if !args.no_stdin {
        spawn_stdin_reader(Arc::clone(&questions));
    }

    log::info!(
        "vlm-watch running: source={} backend={} (Ctrl-C to stop)",
        settings.source.url,
        settings.vlm.backend
    );
    while !cancel.sleep(HEALTH_LOG_INTERVAL) {
        let status = pipeline.status();
        log::info!("health: {}", serde_json::to_string(&status)?);
    }

    log::info!("shutdown signal received, draining pipeline...");
    let drained = pipeline.stop();
    if capture.join().is_err() {
        log::error!("capture thread panicked");
    }
    if let Some(handle) = poller {
        if handle.join().is_err() {
            log::error!("question poller panicked");
        }
    }
    if !drained {
        log::warn!("some inference tasks were cancelled at shutdown");
    }
    Ok(())
}

fn apply_args(settings: &mut PipelineSettings, args: &Args) {
    if let Some(source) = &args.source {
        settings.source.url = source.clone();
    }
    if let Some(mode) = args.mode {
        settings.dispatch.mode = mode;
    }
    if let Some(max) = args.max_concurrent {
        settings.dispatch.max_concurrent = max;
    }
    if let Some(backend) = &args.backend {
        settings.vlm.backend = backend.clone();
    }
    if let Some(results) = &args.results {
        settings.results_path = Some(results.clone());
    }
}

fn build_backends(settings: &PipelineSettings) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::new().with_latency(STUB_LATENCY));
    match HttpBackend::new(settings.vlm.http_config()) {
        Ok(http) => registry.register(http),
        Err(e) if settings.vlm.backend == "http" => return Err(e),
        Err(e) => log::debug!("http backend unavailable: {:#}", e),
    }
    Ok(registry)
}

fn build_sink(settings: &PipelineSettings) -> Result<Arc<dyn ResultSink>> {
    let Some(path) = &settings.results_path else {
        return Ok(Arc::new(LogSink));
    };
    let jsonl = JsonlSink::open(path)?;
    log::info!("writing results to {}", jsonl.path().display());
    Ok(Arc::new(
        FanoutSink::new()
            .with(Arc::new(LogSink))
            .with(Arc::new(jsonl)),
    ))
}

fn publish(questions: &QuestionRegistry, text: &str) {
    match questions.publish(text) {
        Ok(()) => {}
        Err(PublishRejected::SlotBusy(state)) => {
            log::warn!("question slot busy ({:?}); try again shortly", state)
        }
        Err(PublishRejected::BlankQuestion) => {}
    }
}

/// Each stdin line is published as a question. The thread is left detached;
/// it ends with the process.
fn spawn_stdin_reader(questions: Arc<QuestionRegistry>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => publish(&questions, line.trim()),
                Err(e) => {
                    log::warn!("stdin closed: {}", e);
                    break;
                }
            }
        }
    });
}
