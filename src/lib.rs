//! stagegate - stage pipeline orchestrator with agent coordination and approval gates
//!
//! Three cooperating subsystems share one error taxonomy, one event bus and
//! one audit trail:
//!
//! - the stage pipeline runs a DAG of stages with retries, timeouts, circuit
//!   breakers and compensation, recording every transition as an event
//! - the task coordinator assigns tasks to registered agents, rebalances
//!   shared resources and reports conflicts and stalled work
//! - the approval gate moves confirm requests through a multi-step approval
//!   workflow with delegation, escalation and expiry
//!
//! # Modules
//!
//! - `domain`: Data structures (events, executions, agents, confirm requests)
//! - `core`: Pipeline, coordinator, approval gate, security auditor
//! - `adapters`: Store, audit log and event bus interfaces plus implementations
//! - `protocol`: JSON request/response envelopes and the dispatcher
//! - `engine`: Wires everything together
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! stagegate run release --input '{"version": "1.2.0"}'
//!
//! # Check workflow status
//! stagegate status <workflow-id>
//!
//! # Serve the protocol over stdin/stdout
//! stagegate dispatch < requests.jsonl
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod engine;
pub mod error;
pub mod protocol;

// Re-export main types at crate root for convenience
pub use crate::core::{ApprovalGate, PipelineConfig, StagePipeline, TaskCoordinator};
pub use domain::{Event, EventType, ExecutionStatus, WorkflowExecution};
pub use engine::{Engine, EngineBuilder};
pub use error::{CoordError, ErrorCode, Result};
