//! Stage pipeline integration tests
//!
//! Retry timing, rollback, parallel layers, circuit breaking, cancellation and
//! error classification, observed through the returned execution and the
//! event bus.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use stagegate::adapters::BroadcastEventBus;
use stagegate::core::{
    CircuitBreakerConfig, CircuitState, ExecutionOptions, PipelineConfig, RetryPolicy,
    StageContext, StageHandler, StagePipeline, StageSpec,
};
use stagegate::domain::{EventType, ExecutionStatus, StageStatus};
use tokio_util::sync::CancellationToken;
use stagegate::{CoordError, Result};

/// Fails with a retryable error until the given attempt
struct Flaky {
    succeed_on: u32,
    calls: AtomicU32,
}

impl Flaky {
    fn new(succeed_on: u32) -> Self {
        Self {
            succeed_on,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl StageHandler for Flaky {
    async fn execute(&self, ctx: &StageContext) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            return Err(CoordError::ResourceExhaustion(format!("attempt {}", ctx.attempt)));
        }
        Ok(json!({ "attempt": ctx.attempt }))
    }
}

/// Records start order and compensation order
#[derive(Default)]
struct Recorder {
    started: Mutex<Vec<String>>,
    compensated: Mutex<Vec<String>>,
}

struct Recording {
    log: Arc<Recorder>,
    delay_ms: u64,
}

#[async_trait]
impl StageHandler for Recording {
    async fn execute(&self, ctx: &StageContext) -> Result<Value> {
        self.log.started.lock().await.push(ctx.stage.clone());
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(json!({ "stage": ctx.stage }))
    }

    async fn compensate(&self, ctx: &StageContext, _output: &Value) -> Result<()> {
        self.log.compensated.lock().await.push(ctx.stage.clone());
        Ok(())
    }
}

struct Failing {
    error: CoordError,
    calls: AtomicU32,
}

impl Failing {
    fn new(error: CoordError) -> Self {
        Self {
            error,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl StageHandler for Failing {
    async fn execute(&self, _ctx: &StageContext) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Tracks how many calls are in flight at once
#[derive(Default)]
struct Gauge {
    current: AtomicU32,
    peak: AtomicU32,
}

#[async_trait]
impl StageHandler for Gauge {
    async fn execute(&self, _ctx: &StageContext) -> Result<Value> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::Null)
    }
}

/// Fails, then panics, then succeeds
#[derive(Default)]
struct Erratic {
    calls: AtomicU32,
}

#[async_trait]
impl StageHandler for Erratic {
    async fn execute(&self, _ctx: &StageContext) -> Result<Value> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Err(CoordError::Timeout("upstream".into())),
            1 => panic!("handler bug"),
            _ => Ok(json!("ok")),
        }
    }
}

fn pipeline(bus: &Arc<BroadcastEventBus>) -> StagePipeline {
    StagePipeline::new(bus.clone())
}

#[tokio::test(start_paused = true)]
async fn test_retry_backoff_then_success() {
    let bus = Arc::new(BroadcastEventBus::default());
    let flaky = Arc::new(Flaky::new(3));
    let stages = pipeline(&bus).with_handler("plan", flaky.clone());

    let config = PipelineConfig::new(
        "retrying",
        vec![StageSpec::new("plan").with_retry(RetryPolicy {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30000,
        })],
    );

    let started = tokio::time::Instant::now();
    let execution = stages.execute("wf-retry", &config, json!({})).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert!(elapsed >= Duration::from_millis(3000), "elapsed {:?}", elapsed);

    let stage = execution.stage("plan").unwrap();
    assert_eq!(stage.attempts, 3);
    assert_eq!(stage.output, Some(json!({ "attempt": 3 })));

    let retries = bus
        .events_for("wf-retry")
        .await
        .into_iter()
        .filter(|e| e.event_type == EventType::StageRetrying)
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_non_retryable_error_fails_once() {
    let bus = Arc::new(BroadcastEventBus::default());
    let failing = Arc::new(Failing::new(CoordError::Validation("bad input".into())));
    let stages = pipeline(&bus).with_handler("check", failing.clone());

    let config = PipelineConfig::new("strict", vec![StageSpec::new("check")]);
    let execution = stages.execute("wf-strict", &config, json!({})).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    let stage = execution.stage("check").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.attempts, 1);
}

#[tokio::test]
async fn test_rollback_compensates_in_reverse_order() {
    let bus = Arc::new(BroadcastEventBus::default());
    let log = Arc::new(Recorder::default());
    let recording = Arc::new(Recording {
        log: log.clone(),
        delay_ms: 0,
    });
    let stages = pipeline(&bus)
        .with_handler("record", recording)
        .with_handler(
            "explode",
            Arc::new(Failing::new(CoordError::Internal("boom".into()))),
        );

    let options = ExecutionOptions {
        rollback_on_failure: true,
        retry_policy: RetryPolicy::none(),
        ..ExecutionOptions::default()
    };
    let config = PipelineConfig::new(
        "rollback",
        vec![
            StageSpec::new("first").handled_by("record"),
            StageSpec::new("second").handled_by("record").after("first"),
            StageSpec::new("third").handled_by("explode").after("second"),
            StageSpec::new("fourth").handled_by("record").after("third"),
        ],
    )
    .with_options(options);

    let execution = stages.execute("wf-rollback", &config, json!({})).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::RolledBack);
    assert!(execution.compensation_ran);
    assert_eq!(*log.compensated.lock().await, vec!["second", "first"]);
    assert_eq!(execution.stage("fourth").unwrap().status, StageStatus::Skipped);

    let report = execution.report();
    assert_eq!(report.failed, vec!["third"]);
    assert!(report.skipped.contains(&"fourth".to_string()));

    let events = bus.events_for("wf-rollback").await;
    assert_eq!(
        events.last().map(|e| e.event_type),
        Some(EventType::WorkflowRolledBack)
    );
}

#[tokio::test(start_paused = true)]
async fn test_parallel_layer_runs_concurrently() {
    let bus = Arc::new(BroadcastEventBus::default());
    let log = Arc::new(Recorder::default());
    let slow = Arc::new(Recording {
        log: log.clone(),
        delay_ms: 1000,
    });
    let stages = pipeline(&bus).with_handler("work", slow);

    let options = ExecutionOptions {
        parallel_execution: true,
        max_concurrent_executions: 3,
        ..ExecutionOptions::default()
    };
    let config = PipelineConfig::new(
        "fan-out",
        vec![
            StageSpec::new("root").handled_by("work"),
            StageSpec::new("left").handled_by("work").after("root"),
            StageSpec::new("right").handled_by("work").after("root"),
            StageSpec::new("join")
                .handled_by("work")
                .after("left")
                .after("right"),
        ],
    )
    .with_options(options);

    assert_eq!(
        config.plan().unwrap(),
        vec![
            vec!["root".to_string()],
            vec!["left".to_string(), "right".to_string()],
            vec!["join".to_string()],
        ]
    );

    let started = tokio::time::Instant::now();
    let execution = stages.execute("wf-par", &config, json!({})).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    // Three layers of one second each; the middle layer overlaps
    assert!(elapsed < Duration::from_millis(3500), "elapsed {:?}", elapsed);

    let started = log.started.lock().await.clone();
    assert_eq!(started.first().map(String::as_str), Some("root"));
    assert_eq!(started.last().map(String::as_str), Some("join"));
}

#[tokio::test]
async fn test_circuit_opens_after_repeated_failures() {
    let bus = Arc::new(BroadcastEventBus::default());
    let failing = Arc::new(Failing::new(CoordError::Timeout("upstream".into())));
    let stages = pipeline(&bus).with_handler("remote", failing.clone());

    let options = ExecutionOptions {
        retry_policy: RetryPolicy::none(),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            cool_down_ms: 60_000,
            ..CircuitBreakerConfig::default()
        },
        ..ExecutionOptions::default()
    };
    let config =
        PipelineConfig::new("breaker", vec![StageSpec::new("call").handled_by("remote")])
            .with_options(options);

    for run in 0..2 {
        let execution = stages
            .execute(&format!("wf-breaker-{}", run), &config, json!({}))
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }
    assert_eq!(stages.breakers().state("remote").await, CircuitState::Open);

    let execution = stages.execute("wf-breaker-2", &config, json!({})).await.unwrap();
    let stage = execution.stage("call").unwrap();
    assert_eq!(stage.error.as_ref().map(|e| e.code.to_string()).as_deref(), Some("CircuitOpenError"));
    // The handler is not invoked while the circuit is open
    assert_eq!(failing.calls.load(Ordering::SeqCst), 2);

    let short_circuited = bus
        .events_for("wf-breaker-2")
        .await
        .iter()
        .any(|e| e.event_type == EventType::StageShortCircuited);
    assert!(short_circuited);
}

#[tokio::test]
async fn test_cycle_rejected_before_execution() {
    let bus = Arc::new(BroadcastEventBus::default());
    let stages = pipeline(&bus).with_handler(
        "work",
        Arc::new(Recording {
            log: Arc::new(Recorder::default()),
            delay_ms: 0,
        }),
    );
    let options = ExecutionOptions {
        parallel_execution: true,
        ..ExecutionOptions::default()
    };
    let config = PipelineConfig::new(
        "cyclic",
        vec![
            StageSpec::new("a").handled_by("work").after("b"),
            StageSpec::new("b").handled_by("work").after("a"),
        ],
    )
    .with_options(options);

    let err = stages.execute("wf-cycle", &config, json!({})).await.unwrap_err();
    assert!(matches!(err, CoordError::Validation(_)));
    assert!(bus.events_for("wf-cycle").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stage_timeout_is_reported() {
    let bus = Arc::new(BroadcastEventBus::default());
    let slow = Arc::new(Recording {
        log: Arc::new(Recorder::default()),
        delay_ms: 5_000,
    });
    let stages = pipeline(&bus).with_handler("slow", slow);

    let options = ExecutionOptions {
        retry_policy: RetryPolicy::none(),
        ..ExecutionOptions::default()
    };
    let config = PipelineConfig::new(
        "deadline",
        vec![StageSpec::new("wait").handled_by("slow").with_timeout_ms(100)],
    )
    .with_options(options);

    let execution = stages.execute("wf-timeout", &config, json!({})).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.stage("wait").unwrap().error.clone().unwrap();
    assert_eq!(error.code.to_string(), "TimeoutError");
}

#[tokio::test]
async fn test_continue_on_error_runs_independent_stages() {
    let bus = Arc::new(BroadcastEventBus::default());
    let log = Arc::new(Recorder::default());
    let stages = pipeline(&bus)
        .with_handler(
            "record",
            Arc::new(Recording {
                log: log.clone(),
                delay_ms: 0,
            }),
        )
        .with_handler(
            "explode",
            Arc::new(Failing::new(CoordError::Validation("bad row".into()))),
        );

    let options = ExecutionOptions {
        continue_on_error: true,
        retry_policy: RetryPolicy::none(),
        ..ExecutionOptions::default()
    };
    let config = PipelineConfig::new(
        "best-effort",
        vec![
            StageSpec::new("import").handled_by("explode"),
            StageSpec::new("index").handled_by("record"),
            StageSpec::new("publish").handled_by("record").after("import"),
            StageSpec::new("notify").handled_by("record").after("index"),
        ],
    )
    .with_options(options);

    let execution = stages.execute("wf-continue", &config, json!({})).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(!execution.compensation_ran);
    assert_eq!(execution.stage("import").unwrap().status, StageStatus::Failed);
    assert_eq!(execution.stage("index").unwrap().status, StageStatus::Completed);
    assert_eq!(execution.stage("publish").unwrap().status, StageStatus::Skipped);
    assert_eq!(execution.stage("notify").unwrap().status, StageStatus::Completed);
    assert_eq!(*log.started.lock().await, vec!["index", "notify"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_workflow_exhausts_retries_as_timeout() {
    let bus = Arc::new(BroadcastEventBus::default());
    let log = Arc::new(Recorder::default());
    let stages = pipeline(&bus).with_handler(
        "slow",
        Arc::new(Recording {
            log: log.clone(),
            delay_ms: 10_000,
        }),
    );

    let config = PipelineConfig::new(
        "cancellable",
        vec![
            StageSpec::new("wait").handled_by("slow").with_retry(RetryPolicy {
                max_attempts: 3,
                delay_ms: 1000,
                backoff_multiplier: 2.0,
                max_delay_ms: 30000,
            }),
            StageSpec::new("after").handled_by("slow").after("wait"),
        ],
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let execution = stages
        .execute_with_cancel("wf-cancel", &config, json!({}), cancel)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    // Backoff sleeps end early once cancelled
    assert!(started.elapsed() < Duration::from_millis(1000));

    let stage = execution.stage("wait").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.attempts, 3);
    assert_eq!(stage.error.as_ref().unwrap().code.to_string(), "TimeoutError");
    assert_eq!(execution.stage("after").unwrap().status, StageStatus::Skipped);
    assert_eq!(*log.started.lock().await, vec!["wait"]);
}

#[tokio::test(start_paused = true)]
async fn test_layer_wider_than_permits_is_bounded() {
    let bus = Arc::new(BroadcastEventBus::default());
    let gauge = Arc::new(Gauge::default());
    let stages = pipeline(&bus).with_handler("work", gauge.clone());

    let options = ExecutionOptions {
        parallel_execution: true,
        max_concurrent_executions: 2,
        ..ExecutionOptions::default()
    };
    let config = PipelineConfig::new(
        "wide",
        ["s1", "s2", "s3", "s4"]
            .into_iter()
            .map(|name| StageSpec::new(name).handled_by("work"))
            .collect(),
    )
    .with_options(options);

    let started = tokio::time::Instant::now();
    let execution = stages.execute("wf-wide", &config, json!({})).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
    // Four one-second stages through two permits
    assert!(elapsed >= Duration::from_millis(2000), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3000), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_panicked_trial_call_reopens_circuit() {
    let bus = Arc::new(BroadcastEventBus::default());
    let erratic = Arc::new(Erratic::default());
    let stages = pipeline(&bus).with_handler("remote", erratic.clone());

    let options = ExecutionOptions {
        retry_policy: RetryPolicy::none(),
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            cool_down_ms: 1000,
            ..CircuitBreakerConfig::default()
        },
        ..ExecutionOptions::default()
    };
    let config =
        PipelineConfig::new("trial", vec![StageSpec::new("call").handled_by("remote")])
            .with_options(options);

    let first = stages.execute("wf-trial-0", &config, json!({})).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Failed);
    assert_eq!(stages.breakers().state("remote").await, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let panicked = stages.execute("wf-trial-1", &config, json!({})).await.unwrap();
    assert_eq!(panicked.status, ExecutionStatus::Failed);
    assert_eq!(
        panicked.stage("call").unwrap().error.as_ref().unwrap().code.to_string(),
        "InternalError"
    );
    assert_eq!(stages.breakers().state("remote").await, CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let recovered = stages.execute("wf-trial-2", &config, json!({})).await.unwrap();
    assert_eq!(recovered.status, ExecutionStatus::Completed);
    assert_eq!(erratic.calls.load(Ordering::SeqCst), 3);
    assert_eq!(stages.breakers().state("remote").await, CircuitState::Closed);
}
