//! JSONL persistence tests
//!
//! Event log replay, workflow reconstruction, resume from history, and an
//! engine opened against a home directory.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use stagegate::adapters::JsonlEventLog;
use stagegate::config::{Config, Settings};
use stagegate::core::{
    ExecutionOptions, PipelineConfig, RetryPolicy, StageContext, StageHandler, StageSpec,
};
use stagegate::domain::{EventType, StageStatus};
use stagegate::{CoordError, Engine, ExecutionStatus, Result};

/// Counts calls; fails while `broken` is set
struct Switchable {
    broken: AtomicBool,
    calls: AtomicU32,
}

impl Switchable {
    fn new(broken: bool) -> Self {
        Self {
            broken: AtomicBool::new(broken),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl StageHandler for Switchable {
    async fn execute(&self, ctx: &StageContext) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(CoordError::Validation(format!("{} is broken", ctx.stage)));
        }
        Ok(json!({ "stage": ctx.stage }))
    }
}

fn two_stage_pipeline() -> PipelineConfig {
    PipelineConfig::new(
        "ingest",
        vec![
            StageSpec::new("fetch").handled_by("fetcher"),
            StageSpec::new("store").handled_by("storer").after("fetch"),
        ],
    )
    .with_options(ExecutionOptions {
        retry_policy: RetryPolicy::none(),
        ..ExecutionOptions::default()
    })
}

#[tokio::test]
async fn test_events_persist_and_rebuild_execution() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::open(temp.path().join("events")).await.unwrap());
    let engine = Engine::builder(Settings::default())
        .event_log(log.clone())
        .handler("fetcher", Arc::new(Switchable::new(false)))
        .handler("storer", Arc::new(Switchable::new(false)))
        .build();

    let execution = engine.run(&two_stage_pipeline(), json!({ "url": "a" })).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let events = log.replay(&execution.id).await.unwrap();
    assert_eq!(events.first().map(|e| e.event_type), Some(EventType::WorkflowStarted));
    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::WorkflowCompleted));
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let rebuilt = log.load_execution(&execution.id).await.unwrap();
    assert_eq!(rebuilt.status, ExecutionStatus::Completed);
    assert_eq!(rebuilt.plan, execution.plan);
    assert_eq!(rebuilt.stage("store").unwrap().status, StageStatus::Completed);

    assert_eq!(log.list_subjects().await.unwrap(), vec![execution.id.clone()]);
}

#[tokio::test]
async fn test_resume_skips_completed_stages() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::open(temp.path()).await.unwrap());
    let fetcher = Arc::new(Switchable::new(false));
    let storer = Arc::new(Switchable::new(true));
    let engine = Engine::builder(Settings::default())
        .event_log(log.clone())
        .handler("fetcher", fetcher.clone())
        .handler("storer", storer.clone())
        .build();
    let pipeline = two_stage_pipeline();
    let input = json!({ "url": "b" });

    let first = engine.run(&pipeline, input.clone()).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert_eq!(first.stage("store").unwrap().status, StageStatus::Failed);

    storer.broken.store(false, Ordering::SeqCst);
    let resumed = engine.resume(&first.id, &pipeline, input).await.unwrap();

    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(storer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        resumed.stage("fetch").unwrap().output,
        Some(json!({ "stage": "fetch" }))
    );

    let rebuilt = log.load_execution(&first.id).await.unwrap();
    assert_eq!(rebuilt.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_resume_with_changed_input_reruns() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::open(temp.path()).await.unwrap());
    let fetcher = Arc::new(Switchable::new(false));
    let engine = Engine::builder(Settings::default())
        .event_log(log)
        .handler("fetcher", fetcher.clone())
        .handler("storer", Arc::new(Switchable::new(false)))
        .build();
    let pipeline = two_stage_pipeline();

    let first = engine.run(&pipeline, json!({ "url": "c" })).await.unwrap();
    engine
        .resume(&first.id, &pipeline, json!({ "url": "d" }))
        .await
        .unwrap();

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_resume_unknown_workflow_is_not_found() {
    let temp = TempDir::new().unwrap();
    let log = Arc::new(JsonlEventLog::open(temp.path()).await.unwrap());
    let engine = Engine::builder(Settings::default()).event_log(log).build();

    let err = engine
        .resume("never-ran", &two_stage_pipeline(), Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::NotFound { .. }));
}

#[tokio::test]
async fn test_open_engine_writes_under_home() {
    let temp = TempDir::new().unwrap();
    let config = Config {
        settings: Settings::default(),
        home: temp.path().to_path_buf(),
        config_file: None,
    };
    let engine = Engine::open(&config).await.unwrap();
    assert!(engine.event_log().is_some());

    let execution = engine
        .run(&PipelineConfig::new("noop", vec![StageSpec::new("echo").handled_by("passthrough")]), json!({ "n": 1 }))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(config.events_dir().join(format!("{}.jsonl", execution.id)).exists());
}
