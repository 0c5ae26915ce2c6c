//! Conflicts, resolutions, and progress reports produced by task coordination.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent::{AssignmentStatus, TaskAssignment};
use super::resource::ResourceAllocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// No agent has the required capabilities
    Capability,
    /// Every capable agent is at capacity
    Capacity,
    /// Claim shrunk or evicted during reallocation
    Resource,
    /// Tasks wait on each other or on unknown tasks
    Dependency,
    /// Tasks scheduled out of dependency order
    Timing,
    /// Task already has an active assignment
    Duplicate,
}

/// Something that blocked or degraded coordination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: Uuid,
    pub conflict_type: ConflictType,
    pub task_ids: Vec<String>,
    pub severity: Severity,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(
        conflict_type: ConflictType,
        task_ids: Vec<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            conflict_type,
            task_ids,
            severity,
            description: description.into(),
            detected_at: Utc::now(),
        }
    }
}

/// Recommended or applied fix for a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Resolution {
    /// Remove one dependency edge of the reported cycle
    BreakCycle { conflict_id: Uuid, cycle: Vec<String> },
    /// A dependency names a task that does not exist
    MissingDependency {
        conflict_id: Uuid,
        task_id: String,
        missing: Vec<String>,
    },
    /// Run the tasks in this order
    Resequence { conflict_id: Uuid, order: Vec<String> },
    /// Rerun reallocation after freeing capacity
    RebalanceResource { conflict_id: Uuid, task_ids: Vec<String> },
    /// Retry assignment once an agent frees up or joins
    AwaitCapacity { conflict_id: Uuid, task_ids: Vec<String> },
    /// Nothing to do
    NoAction { conflict_id: Uuid, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    Reassign,
    ExtendTimeout,
}

/// A task that needs attention during monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionIssue {
    pub task_id: String,
    pub agent_id: Option<String>,
    pub severity: Severity,
    pub description: String,
    pub suggested_action: SuggestedAction,
}

/// Aggregate progress of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub plan_id: String,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub tasks_in_progress: usize,
    pub tasks_failed: usize,
    /// Percentage, 0.0 to 100.0
    pub overall_progress: f64,
    pub issues: Vec<ExecutionIssue>,
}

impl ExecutionProgress {
    pub fn from_assignments(plan_id: impl Into<String>, assignments: &[TaskAssignment]) -> Self {
        let count = |status: AssignmentStatus| {
            assignments.iter().filter(|a| a.status == status).count()
        };
        let tasks_total = assignments.len();
        let tasks_completed = count(AssignmentStatus::Completed);
        let overall_progress = if tasks_total == 0 {
            0.0
        } else {
            tasks_completed as f64 * 100.0 / tasks_total as f64
        };
        Self {
            plan_id: plan_id.into(),
            tasks_total,
            tasks_completed,
            tasks_in_progress: count(AssignmentStatus::InProgress),
            tasks_failed: count(AssignmentStatus::Failed),
            overall_progress,
            issues: Vec::new(),
        }
    }
}

/// Result of a coordination request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<TaskAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<ResourceAllocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolutions: Vec<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ExecutionProgress>,
}

impl CoordinationResult {
    /// True when nothing was left unresolved
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}
