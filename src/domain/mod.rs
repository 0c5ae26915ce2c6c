//! Domain types for the stagegate coordinator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of lifecycle changes
//! - Execution: Stage pipeline run state
//! - Agent / Resource / Coordination: task placement and shared capacity
//! - Confirm: approval workflow state machine
//! - Audit: security audit records

pub mod agent;
pub mod audit;
pub mod confirm;
pub mod coordination;
pub mod events;
pub mod execution;
pub mod resource;

// Re-export commonly used types
pub use agent::{AgentInfo, AgentStatus, AssignmentStatus, Priority, TaskAssignment, TaskSpec};
pub use audit::{ActivityType, AuditEntry, AuditResult, RiskLevel, SuspiciousActivity};
pub use confirm::{
    ApprovalStatus, ApprovalStep, ApprovalWorkflow, Approver, ConfirmRequest, ConfirmStatus,
    Decision, EscalationPolicy, NewConfirm, Outcome, TrailEntry, WorkflowKind,
};
pub use coordination::{
    Conflict, ConflictType, CoordinationResult, ExecutionIssue, ExecutionProgress, Resolution,
    Severity, SuggestedAction,
};
pub use events::{Event, EventType, StageStatus};
pub use execution::{ExecutionStatus, FailureReport, StageError, StageResult, WorkflowExecution};
pub use resource::{AllocationShare, ReallocationConstraints, ResourceAllocation, ResourceDemand};
