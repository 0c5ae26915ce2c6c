//! Lifecycle events published to the event bus.
//!
//! Events are append-only records of what the pipeline, coordinator, and
//! approval gate did. A workflow execution can be reconstructed by replaying
//! the events that share its `subject_id`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Workflow id, task id, or confirm id this event is about
    pub subject_id: String,

    /// Stage name (pipeline events only)
    pub stage: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{workflow_id}:{stage}:{input_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Stage status at the time of the event
    pub status: StageStatus,

    /// Attempt number for stage events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Time taken in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Structured detail (assignment ids, status changes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        subject_id: impl Into<String>,
        stage: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StageStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            subject_id: subject_id.into(),
            stage,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            attempt: None,
            duration_ms: None,
            error: None,
            data: None,
        }
    }

    /// Event about an entity outside a pipeline run (task, confirm request)
    pub fn entity(
        subject_id: impl Into<String>,
        event_type: EventType,
        payload_summary: impl Into<String>,
    ) -> Self {
        let subject_id = subject_id.into();
        let key = format!("{}:{}:{}", subject_id, event_type, Uuid::new_v4().simple());
        Self::new(
            subject_id,
            None,
            event_type,
            key,
            payload_summary.into(),
            StageStatus::Completed,
        )
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Types of lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "workflow.started")]
    WorkflowStarted,
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted,
    #[serde(rename = "workflow.failed")]
    WorkflowFailed,
    #[serde(rename = "workflow.rolled_back")]
    WorkflowRolledBack,

    #[serde(rename = "stage.start")]
    StageStart,
    #[serde(rename = "stage.end")]
    StageEnd,
    #[serde(rename = "stage.error")]
    StageError,
    #[serde(rename = "stage.retrying")]
    StageRetrying,
    #[serde(rename = "stage.short_circuited")]
    StageShortCircuited,
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    #[serde(rename = "stage.compensated")]
    StageCompensated,

    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "task.reassigned")]
    TaskReassigned,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "resource.reallocated")]
    ResourceReallocated,

    #[serde(rename = "confirm.submitted")]
    ConfirmSubmitted,
    #[serde(rename = "confirm.decided")]
    ConfirmDecided,
    #[serde(rename = "confirm.delegated")]
    ConfirmDelegated,
    #[serde(rename = "confirm.status_changed")]
    ConfirmStatusChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowRolledBack => "workflow.rolled_back",
            Self::StageStart => "stage.start",
            Self::StageEnd => "stage.end",
            Self::StageError => "stage.error",
            Self::StageRetrying => "stage.retrying",
            Self::StageShortCircuited => "stage.short_circuited",
            Self::StageSkipped => "stage.skipped",
            Self::StageCompensated => "stage.compensated",
            Self::TaskAssigned => "task.assigned",
            Self::TaskReassigned => "task.reassigned",
            Self::TaskStarted => "task.started",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::ResourceReallocated => "resource.reallocated",
            Self::ConfirmSubmitted => "confirm.submitted",
            Self::ConfirmDecided => "confirm.decided",
            Self::ConfirmDelegated => "confirm.delegated",
            Self::ConfirmStatusChanged => "confirm.status_changed",
        }
    }

    /// True for events emitted by the stage pipeline
    pub fn is_workflow_event(&self) -> bool {
        self.as_str().starts_with("workflow.") || self.as_str().starts_with("stage.")
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started
    #[default]
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,

    /// Not run (aborted workflow or failed dependency)
    Skipped,

    /// Completed, then undone by its compensating handler
    Compensated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::new(
            "wf-1",
            Some("plan".to_string()),
            EventType::StageStart,
            "test-key".to_string(),
            "Starting plan stage".to_string(),
            StageStatus::Running,
        )
        .with_attempt(1);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"stage.start\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::StageStart);
        assert_eq!(parsed.status, StageStatus::Running);
        assert_eq!(parsed.attempt, Some(1));
    }

    #[test]
    fn test_event_with_duration() {
        let event = Event::new(
            "wf-1",
            Some("plan".to_string()),
            EventType::StageEnd,
            "test-key".to_string(),
            "Completed plan stage".to_string(),
            StageStatus::Completed,
        )
        .with_duration(1500);

        assert_eq!(event.duration_ms, Some(1500));
    }

    #[test]
    fn test_entity_event_keys_are_unique() {
        let a = Event::entity("task-1", EventType::TaskAssigned, "assigned");
        let b = Event::entity("task-1", EventType::TaskAssigned, "assigned");
        assert_ne!(a.idempotency_key, b.idempotency_key);
        assert!(!a.event_type.is_workflow_event());
        assert!(EventType::StageError.is_workflow_event());
    }
}
