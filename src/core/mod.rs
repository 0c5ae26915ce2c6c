//! Core coordination logic.
//!
//! This module contains:
//! - Pipeline: stage definitions, retry policy, YAML loading
//! - Orchestrator: the stage pipeline executor (retry, breaker, rollback)
//! - Registry / Coordinator: agents, task placement, shared resources
//! - Approval: confirm requests and their workflows
//! - Security: permissions, risk, suspicious activity
//! - Handlers: the built-in `plan`, `confirm` and `passthrough` stages

pub mod approval;
pub mod circuit;
pub mod conflict;
pub mod coordinator;
pub mod handlers;
pub mod idempotency;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod security;

// Re-export commonly used types
pub use approval::{ApprovalGate, ApprovalSettings, ConfirmUpdate};
pub use circuit::{CircuitBreakerConfig, CircuitBreakers, CircuitState};
pub use coordinator::{
    CoordinationRequest, PriorityBoosts, ScoringPolicy, TaskCoordinator, UnregisterOutcome,
};
pub use handlers::{ConfirmStage, PassthroughStage, PlanStage};
pub use idempotency::{generate_idempotency_key, hash_input};
pub use orchestrator::{StageContext, StageHandler, StagePipeline};
pub use pipeline::{ExecutionOptions, PipelineConfig, RetryPolicy, StageSpec};
pub use registry::AgentRegistry;
pub use security::{
    assess_risk_level, PermissionDecision, PermissionPolicy, PermissionTarget, SecurityAuditor,
    SecuritySettings, SuspiciousActivityRules,
};
