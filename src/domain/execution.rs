//! Workflow execution state and reconstruction from events.
//!
//! A WorkflowExecution represents a single run of the stage pipeline for one
//! target entity. It is mutated only by the pipeline and becomes immutable
//! once it reaches a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoordError, ErrorCode};

use super::events::{Event, EventType, StageStatus};

/// Error recorded against a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&CoordError> for StageError {
    fn from(err: &CoordError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub attempts: u32,
    pub error: Option<StageError>,
    pub duration_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl StageResult {
    pub fn pending(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pending,
            attempts: 0,
            error: None,
            duration_ms: 0,
            started_at: None,
            completed_at: None,
            output: None,
        }
    }
}

/// Overall status of a workflow execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

/// What a partially failed run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub compensation_ran: bool,
}

/// A single run of the stage pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Caller-supplied workflow id
    pub id: String,

    /// Stage layers; stages inside a layer are independent of each other
    pub plan: Vec<Vec<String>>,

    /// Last stage that started
    pub current_stage: Option<String>,

    /// Per-stage results in plan order
    pub stages: Vec<StageResult>,

    pub status: ExecutionStatus,

    pub started_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// True once compensating handlers have run
    pub compensation_ran: bool,
}

impl WorkflowExecution {
    /// Create a new execution for a stage plan
    pub fn new(id: impl Into<String>, plan: Vec<Vec<String>>) -> Self {
        let stages = plan
            .iter()
            .flatten()
            .map(|name| StageResult::pending(name.clone()))
            .collect();
        Self {
            id: id.into(),
            plan,
            current_stage: None,
            stages,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            compensation_ran: false,
        }
    }

    /// Reconstruct execution state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.iter().find(|e| e.event_type.is_workflow_event())?;

        let mut execution = Self {
            id: first_event.subject_id.clone(),
            plan: Vec::new(),
            current_stage: None,
            stages: Vec::new(),
            status: ExecutionStatus::Running,
            started_at: first_event.timestamp,
            completed_at: None,
            compensation_ran: false,
        };

        let subject = execution.id.clone();
        for event in events.iter().filter(|e| e.subject_id == subject) {
            execution.apply_event(event);
        }

        Some(execution)
    }

    /// Apply a single event to update execution state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::WorkflowStarted => {
                self.status = ExecutionStatus::Running;
                self.started_at = event.timestamp;
                if let Some(plan) = event
                    .data
                    .as_ref()
                    .and_then(|d| d.get("plan"))
                    .and_then(|p| serde_json::from_value::<Vec<Vec<String>>>(p.clone()).ok())
                {
                    // A resumed run does not re-emit stages it skipped as done
                    let previous = std::mem::take(&mut self.stages);
                    self.stages = plan
                        .iter()
                        .flatten()
                        .map(|name| {
                            previous
                                .iter()
                                .find(|s| &s.stage == name && s.status == StageStatus::Completed)
                                .cloned()
                                .unwrap_or_else(|| StageResult::pending(name.clone()))
                        })
                        .collect();
                    self.plan = plan;
                }
            }
            EventType::WorkflowCompleted => self.finish_at(ExecutionStatus::Completed, event),
            EventType::WorkflowFailed => self.finish_at(ExecutionStatus::Failed, event),
            EventType::WorkflowRolledBack => {
                self.compensation_ran = true;
                self.finish_at(ExecutionStatus::RolledBack, event);
            }
            _ => {
                let Some(ref name) = event.stage else {
                    return;
                };
                let stage = self.stage_entry(name);
                match event.event_type {
                    EventType::StageStart => {
                        stage.status = StageStatus::Running;
                        stage.attempts = event.attempt.unwrap_or(stage.attempts + 1);
                        if stage.started_at.is_none() {
                            stage.started_at = Some(event.timestamp);
                        }
                    }
                    EventType::StageRetrying => {
                        stage.status = StageStatus::Running;
                    }
                    EventType::StageEnd => {
                        stage.status = StageStatus::Completed;
                        stage.error = None;
                        stage.completed_at = Some(event.timestamp);
                        stage.duration_ms = event.duration_ms.unwrap_or(0);
                    }
                    EventType::StageError | EventType::StageShortCircuited => {
                        stage.status = StageStatus::Failed;
                        stage.completed_at = Some(event.timestamp);
                        stage.duration_ms = event.duration_ms.unwrap_or(0);
                        stage.error = event.error.clone().map(|message| StageError {
                            code: event
                                .data
                                .as_ref()
                                .and_then(|d| d.get("code"))
                                .and_then(|c| serde_json::from_value(c.clone()).ok())
                                .unwrap_or(ErrorCode::InternalError),
                            message,
                        });
                    }
                    EventType::StageSkipped => stage.status = StageStatus::Skipped,
                    EventType::StageCompensated => stage.status = StageStatus::Compensated,
                    _ => {}
                }
                self.current_stage = Some(name.clone());
            }
        }
    }

    fn finish_at(&mut self, status: ExecutionStatus, event: &Event) {
        self.status = status;
        self.completed_at = Some(event.timestamp);
    }

    fn stage_entry(&mut self, name: &str) -> &mut StageResult {
        let idx = match self.stages.iter().position(|s| s.stage == name) {
            Some(idx) => idx,
            None => {
                self.stages.push(StageResult::pending(name));
                self.stages.len() - 1
            }
        };
        &mut self.stages[idx]
    }

    /// Look up a stage result by name
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Replace the stored result for a stage
    pub fn record(&mut self, result: StageResult) {
        self.current_stage = Some(result.stage.clone());
        let slot = self.stage_entry(&result.stage.clone());
        *slot = result;
    }

    /// Move to a terminal status; later calls are ignored
    pub fn finish(&mut self, status: ExecutionStatus) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Check if a specific stage is completed
    pub fn is_stage_completed(&self, name: &str) -> bool {
        self.stage(name)
            .map(|s| s.status == StageStatus::Completed)
            .unwrap_or(false)
    }

    /// Which stages completed, failed, or never ran
    pub fn report(&self) -> FailureReport {
        let names = |wanted: &[StageStatus]| {
            self.stages
                .iter()
                .filter(|s| wanted.contains(&s.status))
                .map(|s| s.stage.clone())
                .collect::<Vec<_>>()
        };
        FailureReport {
            completed: names(&[StageStatus::Completed, StageStatus::Compensated]),
            failed: names(&[StageStatus::Failed]),
            skipped: names(&[StageStatus::Skipped, StageStatus::Pending]),
            compensation_ran: self.compensation_ran,
        }
    }
}
