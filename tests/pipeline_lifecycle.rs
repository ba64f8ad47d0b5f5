use std::sync::Arc;
use std::time::{Duration, Instant};

use vlm_pipeline::{
    CollectorSink, ControllerError, DispatchMode, PipelineController, PipelineSettings, RawImage,
    SegmentPolicy, StubBackend,
};

fn settings(mode: DispatchMode) -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.dispatch.mode = mode;
    settings.dispatch.max_concurrent = 2;
    settings.segment = SegmentPolicy::from_raw(1.0, 0);
    settings.buffer_capacity = 128;
    settings.shutdown_grace = Duration::from_secs(2);
    settings
}

fn feed_seconds(pipeline: &PipelineController, seconds: u64) {
    let ingestor = pipeline.ingestor().unwrap();
    for i in 0..seconds * 10 {
        ingestor
            .submit(
                RawImage::rgb(vec![(i % 200) as u8; 16 * 16 * 3], 16, 16),
                Duration::from_millis(i * 100),
            )
            .unwrap();
    }
}

#[test]
fn start_twice_is_rejected_and_stop_twice_is_a_no_op() {
    let pipeline = PipelineController::new(
        settings(DispatchMode::Async),
        Arc::new(StubBackend::new()),
        Arc::new(CollectorSink::new()),
    );
    pipeline.start().unwrap();
    let err = pipeline.start().unwrap_err();
    assert_eq!(
        err.downcast_ref::<ControllerError>(),
        Some(&ControllerError::AlreadyRunning)
    );
    assert!(pipeline.is_running());

    assert!(pipeline.stop());
    assert!(pipeline.stop());
    assert!(!pipeline.is_running());
    assert!(pipeline.ingestor().is_err());

    // A stopped pipeline can be started again with a fresh ingestor.
    pipeline.start().unwrap();
    assert!(pipeline.ingestor().is_ok());
    pipeline.stop();
}

#[test]
fn async_run_answers_question_once() {
    let sink = Arc::new(CollectorSink::new());
    let backend = Arc::new(StubBackend::new().with_latency(Duration::from_millis(30)));
    let pipeline = PipelineController::new(settings(DispatchMode::Async), backend.clone(), sink.clone());
    pipeline.start().unwrap();
    pipeline.questions().publish("is a red car parked?").unwrap();

    feed_seconds(&pipeline, 4);
    assert!(pipeline.stop());

    let outcomes = sink.outcomes();
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|o| o.is_success()));
    let answered: Vec<_> = outcomes.iter().filter(|o| o.question.is_some()).collect();
    assert_eq!(answered.len(), 1);
    assert_eq!(answered[0].segment_id, 0);

    let mut segment_ids: Vec<u64> = outcomes.iter().map(|o| o.segment_id).collect();
    segment_ids.sort_unstable();
    assert_eq!(segment_ids, vec![0, 1, 2, 3]);
    assert_eq!(backend.calls().len(), 4);
}

#[test]
fn stop_cancels_slow_inference_within_grace() {
    let sink = Arc::new(CollectorSink::new());
    let mut slow = settings(DispatchMode::Async);
    slow.shutdown_grace = Duration::from_millis(200);
    let pipeline = PipelineController::new(
        slow,
        Arc::new(StubBackend::new().with_latency(Duration::from_secs(20))),
        sink.clone(),
    );
    pipeline.start().unwrap();
    feed_seconds(&pipeline, 2);

    let started = Instant::now();
    assert!(!pipeline.stop());
    assert!(started.elapsed() < Duration::from_secs(5));

    let outcomes = sink.outcomes();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| !o.is_success()));
    assert!(outcomes.iter().all(|o| o.error.is_some()));
}

#[test]
fn status_reports_progress() {
    let pipeline = PipelineController::new(
        settings(DispatchMode::Sync),
        Arc::new(StubBackend::new()),
        Arc::new(CollectorSink::new()),
    );
    assert!(!pipeline.status().running);
    pipeline.start().unwrap();
    feed_seconds(&pipeline, 2);

    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.status().segments.segments_emitted < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let status = pipeline.status();
    assert!(status.running);
    assert_eq!(status.ingest.unwrap().submitted, 20);
    assert!(status.segments.segments_emitted >= 1);
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["question"]["state"], "empty");
    pipeline.stop();
}
