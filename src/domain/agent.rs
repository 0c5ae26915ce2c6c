//! Agents, task specs, and task assignments.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A worker (human or automated) with capabilities and bounded capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub current_load: u32,
    pub max_concurrent_tasks: u32,
    pub registered_at: DateTime<Utc>,
}

impl AgentInfo {
    pub fn new<I, S>(agent_id: impl Into<String>, capabilities: I, max_concurrent_tasks: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_id: agent_id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Available,
            current_load: 0,
            max_concurrent_tasks,
            registered_at: Utc::now(),
        }
    }

    /// Start with a non-zero load (agents joining with work already in hand)
    pub fn with_load(mut self, current_load: u32) -> Self {
        self.current_load = current_load;
        self.refresh_status();
        self
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load < self.max_concurrent_tasks
    }

    /// True if every requirement is among the agent's capabilities
    pub fn supports_all(&self, requirements: &[String]) -> bool {
        requirements.iter().all(|r| self.capabilities.contains(r))
    }

    /// Fraction of requirements this agent covers (1.0 when none are required)
    pub fn capability_match(&self, requirements: &[String]) -> f64 {
        if requirements.is_empty() {
            return 1.0;
        }
        let matched = requirements
            .iter()
            .filter(|r| self.capabilities.contains(*r))
            .count();
        matched as f64 / requirements.len() as f64
    }

    /// Share of the agent's capabilities the task actually uses
    pub fn specialization(&self, requirements: &[String]) -> f64 {
        if self.capabilities.is_empty() {
            return 0.0;
        }
        let used = self
            .capabilities
            .iter()
            .filter(|c| requirements.contains(c))
            .count();
        used as f64 / self.capabilities.len() as f64
    }

    pub fn utilization(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            return 1.0;
        }
        self.current_load as f64 / self.max_concurrent_tasks as f64
    }

    /// Derive busy/available from load; offline is sticky
    pub fn refresh_status(&mut self) {
        if self.status == AgentStatus::Offline {
            return;
        }
        self.status = if self.has_capacity() {
            AgentStatus::Available
        } else {
            AgentStatus::Busy
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    Offline,
}

/// Task priority; higher priorities are assigned and allocated first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "normal" | "medium" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" | "urgent" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work to be placed on an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,

    /// Capabilities the assignee must have
    #[serde(default)]
    pub requirements: Vec<String>,

    #[serde(default)]
    pub priority: Priority,

    /// Tasks that must finish first
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Expected run time before the task is flagged as stalled
    #[serde(default)]
    pub expected_duration_ms: Option<u64>,
}

impl TaskSpec {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            requirements: Vec::new(),
            priority: Priority::Normal,
            dependencies: BTreeSet::new(),
            expected_duration_ms: None,
        }
    }

    pub fn requiring<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.insert(task_id.into());
        self
    }

    pub fn expecting_ms(mut self, expected_duration_ms: u64) -> Self {
        self.expected_duration_ms = Some(expected_duration_ms);
        self
    }
}

/// Binding of a task to an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub agent_id: String,
    pub plan_id: String,
    pub priority: Priority,
    pub requirements: Vec<String>,
    pub dependencies: BTreeSet<String>,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last status change; drives stall detection
    pub updated_at: DateTime<Utc>,
    pub expected_duration_ms: Option<u64>,
}

impl TaskAssignment {
    pub fn new(spec: &TaskSpec, plan_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_id: spec.task_id.clone(),
            agent_id: agent_id.into(),
            plan_id: plan_id.into(),
            priority: spec.priority,
            requirements: spec.requirements.clone(),
            dependencies: spec.dependencies.clone(),
            status: AssignmentStatus::Assigned,
            assigned_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            expected_duration_ms: spec.expected_duration_ms,
        }
    }

    /// Rebuild the TaskSpec this assignment was created from
    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            task_id: self.task_id.clone(),
            requirements: self.requirements.clone(),
            priority: self.priority,
            dependencies: self.dependencies.clone(),
            expected_duration_ms: self.expected_duration_ms,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            AssignmentStatus::Assigned | AssignmentStatus::InProgress
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "assigned" => Some(Self::Assigned),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
