//! Stage pipeline orchestrator.
//!
//! Coordinates stage execution (sequential or in bounded-parallel dependency
//! layers), retry with backoff, circuit breaking, cancellation, compensation,
//! and lifecycle event publishing.
//!
//! Each stage buffers its own events and the batch is flushed when the stage
//! finishes, so a workflow's events reach the bus in stage-completion order
//! even when stages overlap.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::EventBus;
use crate::domain::{
    Event, EventType, ExecutionStatus, StageError, StageResult, StageStatus, WorkflowExecution,
};
use crate::error::{CoordError, Result};

use super::circuit::CircuitBreakers;
use super::idempotency::generate_idempotency_key;
use super::pipeline::{ExecutionOptions, PipelineConfig, StageSpec};

/// A unit of work the pipeline can run as a stage
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Run the stage; the returned value becomes the stage output
    async fn execute(&self, ctx: &StageContext) -> Result<Value>;

    /// Undo a completed stage during rollback
    async fn compensate(&self, _ctx: &StageContext, _output: &Value) -> Result<()> {
        Ok(())
    }
}

/// Everything a handler sees about the stage it is running
#[derive(Debug, Clone)]
pub struct StageContext {
    pub workflow_id: String,
    pub stage: String,
    pub attempt: u32,
    /// Workflow input
    pub input: Arc<Value>,
    /// Static stage parameters from the pipeline definition
    pub params: Value,
    /// Outputs of stages completed before this stage's layer started
    pub outputs: Arc<BTreeMap<String, Value>>,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn output_of(&self, stage: &str) -> Option<&Value> {
        self.outputs.get(stage)
    }

    /// Stage parameter, falling back to the workflow input
    pub fn param(&self, field: &str) -> Option<&Value> {
        self.params.get(field).or_else(|| self.input.get(field))
    }
}

/// What one stage run produced
struct StageOutcome {
    result: StageResult,
    events: Vec<Event>,
    output: Option<Value>,
}

/// A stage ready to run on its own task
struct StageJob {
    handler: Arc<dyn StageHandler>,
    breakers: Arc<CircuitBreakers>,
    spec: StageSpec,
    options: Arc<ExecutionOptions>,
    workflow_id: String,
    input: Arc<Value>,
    outputs: Arc<BTreeMap<String, Value>>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
}

impl StageJob {
    async fn run(self) -> StageOutcome {
        let _permit = self.permits.acquire().await.ok();

        let name = self.spec.name.clone();
        let stage_type = self.spec.handler_name().to_string();
        let policy = self.spec.effective_retry(&self.options).clone();
        let timeout = self.spec.timeout(&self.options);
        let breaker_config = &self.options.circuit_breaker;
        let key = stage_key(&self.workflow_id, &self.spec, &self.input);

        let mut events = Vec::new();
        let mut result = StageResult::pending(&name);
        result.started_at = Some(Utc::now());
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            result.attempts = attempt;

            if !self.breakers.try_acquire(&stage_type, breaker_config).await {
                let err = CoordError::CircuitOpen(stage_type.clone());
                warn!(
                    workflow_id = %self.workflow_id,
                    stage = %name,
                    "Circuit open, short-circuiting stage"
                );
                events.push(
                    self.event(
                        EventType::StageShortCircuited,
                        &key,
                        format!("Stage '{}' short-circuited", name),
                        StageStatus::Failed,
                    )
                    .with_attempt(attempt)
                    .with_error(err.to_string())
                    .with_data(json!({ "code": err.code() })),
                );
                return self.failed(result, events, started, &err);
            }

            events.push(
                self.event(
                    EventType::StageStart,
                    &key,
                    format!("Stage '{}' attempt {}", name, attempt),
                    StageStatus::Running,
                )
                .with_attempt(attempt),
            );

            let ctx = StageContext {
                workflow_id: self.workflow_id.clone(),
                stage: name.clone(),
                attempt,
                input: Arc::clone(&self.input),
                params: self.spec.params.clone(),
                outputs: Arc::clone(&self.outputs),
                cancel: self.cancel.child_token(),
            };

            let outcome = if self.cancel.is_cancelled() {
                Err(cancelled(&name))
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(cancelled(&name)),
                    res = tokio::time::timeout(timeout, self.handler.execute(&ctx)) => {
                        res.unwrap_or_else(|_| {
                            Err(CoordError::Timeout(format!(
                                "stage '{}' exceeded {}ms",
                                name,
                                timeout.as_millis()
                            )))
                        })
                    }
                }
            };

            match outcome {
                Ok(output) => {
                    self.breakers.record_success(&stage_type).await;
                    let duration_ms = started.elapsed().as_millis() as u64;
                    debug!(workflow_id = %self.workflow_id, stage = %name, duration_ms, "Stage completed");

                    events.push(
                        self.event(
                            EventType::StageEnd,
                            &key,
                            format!("Stage '{}' completed in {}ms", name, duration_ms),
                            StageStatus::Completed,
                        )
                        .with_attempt(attempt)
                        .with_duration(duration_ms)
                        .with_data(json!({ "output": output })),
                    );

                    result.status = StageStatus::Completed;
                    result.duration_ms = duration_ms;
                    result.completed_at = Some(Utc::now());
                    result.output = Some(output.clone());
                    return StageOutcome {
                        result,
                        events,
                        output: Some(output),
                    };
                }
                Err(err) => {
                    self.breakers.record_failure(&stage_type, breaker_config).await;

                    if err.is_retryable() && policy.should_retry(attempt) {
                        let delay = policy.delay_for_attempt(attempt);
                        warn!(
                            workflow_id = %self.workflow_id,
                            stage = %name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Stage failed, retrying"
                        );
                        events.push(
                            self.event(
                                EventType::StageRetrying,
                                &key,
                                format!(
                                    "Stage '{}' failed, retrying in {:?}: {}",
                                    name, delay, err
                                ),
                                StageStatus::Running,
                            )
                            .with_attempt(attempt)
                            .with_error(err.to_string()),
                        );

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.cancel.cancelled() => {}
                        }
                        continue;
                    }

                    error!(
                        workflow_id = %self.workflow_id,
                        stage = %name,
                        attempt,
                        error = %err,
                        "Stage failed permanently"
                    );
                    events.push(
                        self.event(
                            EventType::StageError,
                            &key,
                            format!(
                                "Stage '{}' failed after {} attempts: {}",
                                name, attempt, err
                            ),
                            StageStatus::Failed,
                        )
                        .with_attempt(attempt)
                        .with_duration(started.elapsed().as_millis() as u64)
                        .with_error(err.to_string())
                        .with_data(json!({ "code": err.code() })),
                    );
                    return self.failed(result, events, started, &err);
                }
            }
        }
    }

    fn event(&self, event_type: EventType, key: &str, summary: String, status: StageStatus) -> Event {
        Event::new(
            self.workflow_id.clone(),
            Some(self.spec.name.clone()),
            event_type,
            key.to_string(),
            summary,
            status,
        )
    }

    fn failed(
        &self,
        mut result: StageResult,
        events: Vec<Event>,
        started: Instant,
        err: &CoordError,
    ) -> StageOutcome {
        result.status = StageStatus::Failed;
        result.error = Some(StageError::from(err));
        result.duration_ms = started.elapsed().as_millis() as u64;
        result.completed_at = Some(Utc::now());
        StageOutcome {
            result,
            events,
            output: None,
        }
    }
}

fn cancelled(stage: &str) -> CoordError {
    CoordError::Timeout(format!("stage '{}' cancelled", stage))
}

/// Idempotency key over the workflow input and the stage's own parameters
fn stage_key(workflow_id: &str, spec: &StageSpec, input: &Value) -> String {
    let fingerprint = json!({ "input": input, "params": spec.params }).to_string();
    generate_idempotency_key(workflow_id, &spec.name, &fingerprint)
}

/// Top-level workflow driver
pub struct StagePipeline {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
    events: Arc<dyn EventBus>,
    breakers: Arc<CircuitBreakers>,
}

impl StagePipeline {
    pub fn new(events: Arc<dyn EventBus>) -> Self {
        Self {
            handlers: HashMap::new(),
            events,
            breakers: Arc::new(CircuitBreakers::new()),
        }
    }

    /// Register a handler for a stage type
    pub fn register(&mut self, stage_type: impl Into<String>, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage_type.into(), handler);
    }

    pub fn with_handler(mut self, stage_type: impl Into<String>, handler: Arc<dyn StageHandler>) -> Self {
        self.register(stage_type, handler);
        self
    }

    pub fn has_handler(&self, stage_type: &str) -> bool {
        self.handlers.contains_key(stage_type)
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Execute a pipeline for one workflow
    pub async fn execute(
        &self,
        workflow_id: &str,
        config: &PipelineConfig,
        input: Value,
    ) -> Result<WorkflowExecution> {
        self.run(workflow_id, config, input, CancellationToken::new(), &[])
            .await
    }

    /// Execute with a caller-owned cancellation token
    pub async fn execute_with_cancel(
        &self,
        workflow_id: &str,
        config: &PipelineConfig,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecution> {
        self.run(workflow_id, config, input, cancel, &[]).await
    }

    /// Re-run a workflow, skipping stages whose idempotency key already completed in `history`
    pub async fn resume(
        &self,
        workflow_id: &str,
        config: &PipelineConfig,
        input: Value,
        history: &[Event],
    ) -> Result<WorkflowExecution> {
        self.run(workflow_id, config, input, CancellationToken::new(), history)
            .await
    }

    #[instrument(skip(self, config, input, cancel, history), fields(pipeline = %config.name))]
    async fn run(
        &self,
        workflow_id: &str,
        config: &PipelineConfig,
        input: Value,
        cancel: CancellationToken,
        history: &[Event],
    ) -> Result<WorkflowExecution> {
        let plan = config.plan()?;
        for stage in &config.stages {
            if !self.has_handler(stage.handler_name()) {
                return Err(CoordError::Validation(format!(
                    "No handler registered for stage type '{}'",
                    stage.handler_name()
                )));
            }
        }

        info!(workflow_id, "Starting workflow execution");

        let options = Arc::new(config.options.clone());
        let input = Arc::new(input);
        let permits = Arc::new(Semaphore::new(options.max_concurrent_executions));
        let started = Instant::now();

        let mut execution = WorkflowExecution::new(workflow_id, plan.clone());
        execution.status = ExecutionStatus::Running;

        self.publish(
            Event::new(
                workflow_id,
                None,
                EventType::WorkflowStarted,
                format!("{}:start", workflow_id),
                format!("Workflow '{}' started", config.name),
                StageStatus::Running,
            )
            .with_data(json!({ "plan": plan })),
        )
        .await;

        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut completed: Vec<String> = Vec::new();
        let mut unsuccessful: HashSet<String> = HashSet::new();
        let mut any_failed = false;
        let mut aborted = false;

        for layer in &plan {
            let mut runnable: Vec<&StageSpec> = Vec::new();

            for name in layer {
                let Some(spec) = config.stage(name) else {
                    continue;
                };

                let blocked_by = spec.depends_on.iter().find(|d| unsuccessful.contains(*d));
                if aborted || blocked_by.is_some() {
                    let reason = match blocked_by {
                        Some(dep) => format!("dependency '{}' did not complete", dep),
                        None => "workflow aborted".to_string(),
                    };
                    self.skip(&mut execution, spec, &reason).await;
                    unsuccessful.insert(name.clone());
                    continue;
                }

                let key = stage_key(workflow_id, spec, &input);
                let prior = history
                    .iter()
                    .rev()
                    .find(|e| e.event_type == EventType::StageEnd && e.idempotency_key == key);
                if let Some(prior) = prior {
                    info!(stage = %name, "Stage already completed, skipping");
                    let output = prior
                        .data
                        .as_ref()
                        .and_then(|d| d.get("output"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    let mut result = StageResult::pending(name.clone());
                    result.status = StageStatus::Completed;
                    result.attempts = prior.attempt.unwrap_or(1);
                    result.duration_ms = prior.duration_ms.unwrap_or(0);
                    result.completed_at = Some(prior.timestamp);
                    result.output = Some(output.clone());
                    execution.record(result);
                    outputs.insert(name.clone(), output);
                    completed.push(name.clone());
                    continue;
                }

                runnable.push(spec);
            }

            if runnable.is_empty() {
                continue;
            }

            let snapshot = Arc::new(outputs.clone());
            let mut set = JoinSet::new();
            for spec in &runnable {
                let Some(handler) = self.handlers.get(spec.handler_name()) else {
                    continue;
                };
                let job = StageJob {
                    handler: Arc::clone(handler),
                    breakers: Arc::clone(&self.breakers),
                    spec: (*spec).clone(),
                    options: Arc::clone(&options),
                    workflow_id: workflow_id.to_string(),
                    input: Arc::clone(&input),
                    outputs: Arc::clone(&snapshot),
                    cancel: cancel.clone(),
                    permits: Arc::clone(&permits),
                };
                set.spawn(job.run());
            }

            let mut finished: HashSet<String> = HashSet::new();
            while let Some(joined) = set.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(workflow_id, error = %err, "Stage task aborted");
                        continue;
                    }
                };

                for event in outcome.events {
                    self.publish(event).await;
                }

                let name = outcome.result.stage.clone();
                finished.insert(name.clone());
                if outcome.result.status == StageStatus::Completed {
                    outputs.insert(name.clone(), outcome.output.unwrap_or(Value::Null));
                    completed.push(name);
                } else {
                    unsuccessful.insert(name);
                    any_failed = true;
                }
                execution.record(outcome.result);
            }

            // Stage tasks that panicked never reported back
            for spec in &runnable {
                if finished.contains(&spec.name) {
                    continue;
                }
                let err = CoordError::Internal(format!("stage '{}' task panicked", spec.name));
                self.breakers
                    .record_failure(spec.handler_name(), &options.circuit_breaker)
                    .await;
                let mut result = StageResult::pending(spec.name.clone());
                result.status = StageStatus::Failed;
                result.error = Some(StageError::from(&err));
                result.completed_at = Some(Utc::now());
                self.publish(
                    Event::new(
                        workflow_id,
                        Some(spec.name.clone()),
                        EventType::StageError,
                        stage_key(workflow_id, spec, &input),
                        format!("Stage '{}' failed: {}", spec.name, err),
                        StageStatus::Failed,
                    )
                    .with_error(err.to_string())
                    .with_data(json!({ "code": err.code() })),
                )
                .await;
                execution.record(result);
                unsuccessful.insert(spec.name.clone());
                any_failed = true;
            }

            if any_failed && !options.continue_on_error {
                aborted = true;
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;

        if !any_failed {
            execution.finish(ExecutionStatus::Completed);
            info!(workflow_id, duration_ms, "Workflow completed");
            self.publish(
                Event::new(
                    workflow_id,
                    None,
                    EventType::WorkflowCompleted,
                    format!("{}:complete", workflow_id),
                    format!("Workflow '{}' completed in {}ms", config.name, duration_ms),
                    StageStatus::Completed,
                )
                .with_duration(duration_ms),
            )
            .await;
            return Ok(execution);
        }

        if options.rollback_on_failure {
            self.compensate(&mut execution, config, &completed, &outputs, &input, &cancel)
                .await;
            execution.compensation_ran = true;
            execution.finish(ExecutionStatus::RolledBack);
            warn!(workflow_id, duration_ms, "Workflow rolled back");
            self.publish(
                Event::new(
                    workflow_id,
                    None,
                    EventType::WorkflowRolledBack,
                    format!("{}:complete", workflow_id),
                    format!("Workflow '{}' rolled back", config.name),
                    StageStatus::Compensated,
                )
                .with_duration(duration_ms)
                .with_data(json!({ "report": execution.report() })),
            )
            .await;
        } else {
            execution.finish(ExecutionStatus::Failed);
            let report = execution.report();
            error!(workflow_id, failed = ?report.failed, "Workflow failed");
            self.publish(
                Event::new(
                    workflow_id,
                    None,
                    EventType::WorkflowFailed,
                    format!("{}:complete", workflow_id),
                    format!("Workflow '{}' failed", config.name),
                    StageStatus::Failed,
                )
                .with_duration(duration_ms)
                .with_error(format!("failed stages: {}", report.failed.join(", ")))
                .with_data(json!({ "report": report })),
            )
            .await;
        }

        Ok(execution)
    }

    /// Run compensating handlers for completed stages, newest first
    async fn compensate(
        &self,
        execution: &mut WorkflowExecution,
        config: &PipelineConfig,
        completed: &[String],
        outputs: &BTreeMap<String, Value>,
        input: &Arc<Value>,
        cancel: &CancellationToken,
    ) {
        let snapshot = Arc::new(outputs.clone());

        for name in completed.iter().rev() {
            let Some(spec) = config.stage(name) else {
                continue;
            };
            let Some(handler) = self.handlers.get(spec.handler_name()) else {
                continue;
            };
            let attempt = execution.stage(name).map(|s| s.attempts).unwrap_or(1);
            let ctx = StageContext {
                workflow_id: execution.id.clone(),
                stage: name.clone(),
                attempt,
                input: Arc::clone(input),
                params: spec.params.clone(),
                outputs: Arc::clone(&snapshot),
                cancel: cancel.child_token(),
            };
            let output = outputs.get(name).cloned().unwrap_or(Value::Null);

            let timeout = spec.timeout(&config.options);
            let result = tokio::time::timeout(timeout, handler.compensate(&ctx, &output))
                .await
                .unwrap_or_else(|_| Err(CoordError::Timeout(format!("compensating '{}'", name))));

            match result {
                Ok(()) => {
                    info!(workflow_id = %execution.id, stage = %name, "Stage compensated");
                    if let Some(stage) = execution.stages.iter_mut().find(|s| &s.stage == name) {
                        stage.status = StageStatus::Compensated;
                    }
                    self.publish(Event::new(
                        execution.id.clone(),
                        Some(name.clone()),
                        EventType::StageCompensated,
                        format!("{}:{}:compensate", execution.id, name),
                        format!("Stage '{}' compensated", name),
                        StageStatus::Compensated,
                    ))
                    .await;
                }
                Err(err) => {
                    error!(
                        workflow_id = %execution.id,
                        stage = %name,
                        error = %err,
                        "Compensation failed"
                    );
                }
            }
        }
    }

    async fn skip(&self, execution: &mut WorkflowExecution, spec: &StageSpec, reason: &str) {
        debug!(workflow_id = %execution.id, stage = %spec.name, reason, "Skipping stage");
        let mut result = StageResult::pending(spec.name.clone());
        result.status = StageStatus::Skipped;
        execution.record(result);

        self.publish(Event::new(
            execution.id.clone(),
            Some(spec.name.clone()),
            EventType::StageSkipped,
            format!("{}:{}:skip", execution.id, spec.name),
            format!("Stage '{}' skipped: {}", spec.name, reason),
            StageStatus::Skipped,
        ))
        .await;
    }

    async fn publish(&self, event: Event) {
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "Failed to publish lifecycle event");
        }
    }
}
