//! Built-in stage handlers.
//!
//! `plan` assigns the workflow's tasks through the coordinator, `confirm`
//! submits (or reuses) a confirm request and optionally waits for it, and
//! `passthrough` hands its input on unchanged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{ConfirmStatus, ConflictType, NewConfirm, TaskSpec};
use crate::error::{CoordError, Result};

use super::approval::ApprovalGate;
use super::coordinator::TaskCoordinator;
use super::orchestrator::{StageContext, StageHandler};

fn parse_param<T: serde::de::DeserializeOwned>(ctx: &StageContext, field: &str) -> Result<Option<T>> {
    match ctx.param(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
            CoordError::Validation(format!("stage '{}' param '{}': {}", ctx.stage, field, e))
        }),
    }
}

/// Assigns `tasks` to agents
///
/// Params: `tasks`, optional `plan_id` (defaults to the workflow id),
/// `candidate_agents`, and `strict` (default true: any unassigned task fails
/// the stage).
pub struct PlanStage {
    coordinator: Arc<TaskCoordinator>,
}

impl PlanStage {
    pub fn new(coordinator: Arc<TaskCoordinator>) -> Self {
        Self { coordinator }
    }

    fn plan_id(ctx: &StageContext) -> Result<String> {
        Ok(parse_param::<String>(ctx, "plan_id")?.unwrap_or_else(|| ctx.workflow_id.clone()))
    }
}

#[async_trait]
impl StageHandler for PlanStage {
    async fn execute(&self, ctx: &StageContext) -> Result<Value> {
        let plan_id = Self::plan_id(ctx)?;
        let tasks: Vec<TaskSpec> = parse_param(ctx, "tasks")?.ok_or_else(|| {
            CoordError::Validation(format!("stage '{}' needs a 'tasks' param", ctx.stage))
        })?;
        let candidates: Option<Vec<String>> = parse_param(ctx, "candidate_agents")?;
        let strict = parse_param::<bool>(ctx, "strict")?.unwrap_or(true);

        let result = self
            .coordinator
            .assign_tasks(&plan_id, tasks, candidates.as_deref())
            .await?;

        // A re-run finds its own earlier assignments as duplicates
        let blocking: Vec<_> = result
            .conflicts
            .iter()
            .filter(|c| c.conflict_type != ConflictType::Duplicate)
            .collect();

        if strict && !blocking.is_empty() {
            let only_capacity = blocking
                .iter()
                .all(|c| c.conflict_type == ConflictType::Capacity);
            let summary = blocking
                .iter()
                .map(|c| c.description.as_str())
                .collect::<Vec<_>>()
                .join("; ");

            // Start the next attempt from a clean slate
            let released = self.coordinator.release_plan(&plan_id).await?;
            debug!(plan_id = %plan_id, released, "Released partial plan");

            return Err(if only_capacity {
                CoordError::ResourceExhaustion(summary)
            } else {
                CoordError::Validation(summary)
            });
        }

        info!(
            plan_id = %plan_id,
            assigned = result.assignments.len(),
            "Plan stage assigned tasks"
        );
        Ok(json!({ "plan_id": plan_id, "result": result }))
    }

    async fn compensate(&self, ctx: &StageContext, output: &Value) -> Result<()> {
        let plan_id = match output.get("plan_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => Self::plan_id(ctx)?,
        };
        let released = self.coordinator.release_plan(&plan_id).await?;
        info!(plan_id = %plan_id, released, "Plan compensated");
        Ok(())
    }
}

/// Submits a confirm request once per workflow stage
///
/// Params: `confirm` (the submission; `context_id` is filled in), optional
/// `context_id` (defaults to `{workflow_id}:{stage}`), and `wait_ms` to block
/// until the request is decided.
pub struct ConfirmStage {
    gate: Arc<ApprovalGate>,
}

impl ConfirmStage {
    pub fn new(gate: Arc<ApprovalGate>) -> Self {
        Self { gate }
    }
}

#[async_trait]
impl StageHandler for ConfirmStage {
    async fn execute(&self, ctx: &StageContext) -> Result<Value> {
        let context_id = parse_param::<String>(ctx, "context_id")?
            .unwrap_or_else(|| format!("{}:{}", ctx.workflow_id, ctx.stage));

        let existing = self
            .gate
            .find_by_context(&context_id)
            .await?
            .filter(|r| !matches!(r.status, ConfirmStatus::Cancelled | ConfirmStatus::Expired));

        let mut request = match existing {
            Some(request) => {
                debug!(confirm_id = %request.confirm_id, "Reusing confirm request");
                request
            }
            None => {
                let mut submission: NewConfirm = parse_param(ctx, "confirm")?.ok_or_else(|| {
                    CoordError::Validation(format!("stage '{}' needs a 'confirm' param", ctx.stage))
                })?;
                submission.context_id = context_id.clone();
                self.gate.submit(submission).await?
            }
        };

        if let Some(wait_ms) = parse_param::<u64>(ctx, "wait_ms")? {
            request = tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(CoordError::Timeout(format!(
                        "cancelled while waiting on confirm {}",
                        request.confirm_id
                    )));
                }
                resolved = self
                    .gate
                    .wait_for_resolution(request.confirm_id, Duration::from_millis(wait_ms)) => resolved?,
            };
        }

        match request.status {
            ConfirmStatus::Rejected => Err(CoordError::Validation(format!(
                "confirm request {} was rejected",
                request.confirm_id
            ))),
            ConfirmStatus::Cancelled | ConfirmStatus::Expired => Err(CoordError::Validation(format!(
                "confirm request {} is {}",
                request.confirm_id, request.status
            ))),
            status => Ok(json!({
                "confirm_id": request.confirm_id,
                "context_id": request.context_id,
                "status": status.as_str(),
            })),
        }
    }

    async fn compensate(&self, _ctx: &StageContext, output: &Value) -> Result<()> {
        let Some(confirm_id) = output
            .get("confirm_id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
        else {
            return Ok(());
        };

        let request = self.gate.get(confirm_id).await?;
        if !request.status.is_open() {
            return Ok(());
        }
        if let Err(err) = self
            .gate
            .cancel(confirm_id, &request.requested_by, Some("workflow rolled back".into()))
            .await
        {
            warn!(%confirm_id, error = %err, "Could not cancel confirm request");
            return Err(err);
        }
        Ok(())
    }
}

/// Returns param `output` if given, otherwise the workflow input
pub struct PassthroughStage;

#[async_trait]
impl StageHandler for PassthroughStage {
    async fn execute(&self, ctx: &StageContext) -> Result<Value> {
        Ok(ctx
            .params
            .get("output")
            .cloned()
            .unwrap_or_else(|| ctx.input.as_ref().clone()))
    }
}
