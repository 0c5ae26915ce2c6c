//! Routes protocol operations to the approval gate and task coordinator.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::adapters::{Filter, Pagination};
use crate::core::{
    ApprovalGate, ConfirmUpdate, CoordinationRequest, PermissionTarget, TaskCoordinator,
};
use crate::domain::{
    AgentInfo, ConfirmStatus, Conflict, CoordinationResult, NewConfirm, Outcome, Priority,
    ReallocationConstraints, ResourceDemand, TaskSpec,
};
use crate::error::{CoordError, Result};

use super::envelope::{RequestEnvelope, ResponseEnvelope, ResponseMetadata};
use super::mapper::{FromProtocol, ToProtocol};
use super::operation::{Operation, QueryPayload};

pub struct Dispatcher {
    gate: Arc<ApprovalGate>,
    coordinator: Arc<TaskCoordinator>,
}

impl Dispatcher {
    pub fn new(gate: Arc<ApprovalGate>, coordinator: Arc<TaskCoordinator>) -> Self {
        Self { gate, coordinator }
    }

    /// Handle one raw JSON request line
    pub async fn dispatch_json(&self, line: &str) -> ResponseEnvelope {
        match serde_json::from_str::<RequestEnvelope>(line) {
            Ok(envelope) => self.dispatch(envelope).await,
            Err(err) => ResponseEnvelope::failure(
                None,
                &CoordError::Validation(format!("malformed request: {}", err)),
                ResponseMetadata {
                    operation: "unknown".to_string(),
                    duration_ms: 0,
                },
            ),
        }
    }

    /// Handle one request; failures become error envelopes
    #[instrument(skip(self, envelope), fields(operation = %envelope.operation))]
    pub async fn dispatch(&self, envelope: RequestEnvelope) -> ResponseEnvelope {
        let started = Instant::now();
        let RequestEnvelope {
            operation,
            payload,
            request_id,
        } = envelope;

        let outcome = match Operation::parse(&operation, payload) {
            Ok(op) => self.execute(op).await,
            Err(err) => Err(err),
        };
        let metadata = ResponseMetadata {
            operation,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match outcome {
            Ok(result) => {
                debug!(duration_ms = metadata.duration_ms, "Operation succeeded");
                ResponseEnvelope::success(request_id, result, metadata)
            }
            Err(err) => {
                warn!(code = %err.code(), error = %err, "Operation failed");
                ResponseEnvelope::failure(request_id, &err, metadata)
            }
        }
    }

    async fn execute(&self, op: Operation) -> Result<Value> {
        match op {
            Operation::Create(dto) => {
                let request = self.gate.submit(NewConfirm::from_protocol(dto)?).await?;
                to_json(request.to_protocol())
            }
            Operation::Approve(p) => {
                let request = self
                    .gate
                    .decide(p.confirm_id, p.step_id, &p.user_id, Outcome::Approve, p.comments)
                    .await?;
                to_json(request.to_protocol())
            }
            Operation::Reject(p) => {
                let request = self
                    .gate
                    .decide(p.confirm_id, p.step_id, &p.user_id, Outcome::Reject, p.comments)
                    .await?;
                to_json(request.to_protocol())
            }
            Operation::Delegate(p) => {
                let request = self
                    .gate
                    .delegate(p.confirm_id, p.step_id, &p.from_user_id, &p.to_user_id, p.reason)
                    .await?;
                to_json(request.to_protocol())
            }
            Operation::Escalate(p) => {
                let request = self.gate.escalate(p.confirm_id, &p.user_id, p.reason).await?;
                to_json(request.to_protocol())
            }
            Operation::Resume(p) => {
                let request = self.gate.resume(p.confirm_id, &p.user_id).await?;
                to_json(request.to_protocol())
            }
            Operation::ResolveEscalation(p) => {
                let outcome = Outcome::parse(&p.outcome).ok_or_else(|| {
                    CoordError::Validation(format!("invalid outcome '{}'", p.outcome))
                })?;
                let request = self
                    .gate
                    .resolve_escalation(p.confirm_id, &p.user_id, outcome, p.comments)
                    .await?;
                to_json(request.to_protocol())
            }
            Operation::Cancel(p) => {
                let request = self.gate.cancel(p.confirm_id, &p.user_id, p.reason).await?;
                to_json(request.to_protocol())
            }
            Operation::Update(p) => {
                let changes = ConfirmUpdate {
                    title: p.title,
                    description: p.description,
                    priority: p
                        .priority
                        .as_deref()
                        .map(|v| {
                            Priority::parse(v).ok_or_else(|| {
                                CoordError::Validation(format!("invalid priority '{}'", v))
                            })
                        })
                        .transpose()?,
                    status: p
                        .status
                        .as_deref()
                        .map(|v| {
                            ConfirmStatus::parse(v).ok_or_else(|| {
                                CoordError::Validation(format!("invalid status '{}'", v))
                            })
                        })
                        .transpose()?,
                };
                let request = self.gate.update(p.confirm_id, &p.user_id, changes).await?;
                to_json(request.to_protocol())
            }
            Operation::Delete(p) => {
                let deleted = self.gate.delete(p.confirm_id, &p.user_id).await?;
                Ok(json!({ "confirmId": p.confirm_id, "deleted": deleted }))
            }
            Operation::Get(p) => {
                if let Some(user_id) = &p.user_id {
                    self.gate
                        .auditor()
                        .require_permission(user_id, &PermissionTarget::Confirm(p.confirm_id), "confirm:read")
                        .await?;
                }
                to_json(self.gate.get(p.confirm_id).await?.to_protocol())
            }
            Operation::List(p) | Operation::Query(p) => self.query(p).await,
            Operation::AssignTasks(p) => {
                let tasks = p
                    .tasks
                    .into_iter()
                    .map(TaskSpec::from_protocol)
                    .collect::<Result<Vec<_>>>()?;
                let request = CoordinationRequest::AssignTasks {
                    plan_id: p.plan_id,
                    tasks,
                    candidate_agents: p.candidate_agents,
                };
                self.coordinate(request, p.requested_by.as_deref()).await
            }
            Operation::ReallocateResources(p) => {
                let demands = p
                    .demands
                    .into_iter()
                    .map(ResourceDemand::from_protocol)
                    .collect::<Result<Vec<_>>>()?;
                let mut constraints = ReallocationConstraints {
                    demands,
                    capacity: p.capacity,
                    ..Default::default()
                };
                if let Some(allow_partial) = p.allow_partial {
                    constraints.allow_partial = allow_partial;
                }
                let request = CoordinationRequest::ReallocateResources {
                    resource_id: p.resource_id,
                    constraints,
                };
                self.coordinate(request, p.requested_by.as_deref()).await
            }
            Operation::ResolveConflict(p) => {
                let conflicts = p
                    .conflicts
                    .into_iter()
                    .map(Conflict::from_protocol)
                    .collect::<Result<Vec<_>>>()?;
                let tasks = p
                    .tasks
                    .into_iter()
                    .map(TaskSpec::from_protocol)
                    .collect::<Result<Vec<_>>>()?;
                let request = CoordinationRequest::ResolveConflict { conflicts, tasks };
                self.coordinate(request, p.requested_by.as_deref()).await
            }
            Operation::MonitorExecution(p) => {
                let request = CoordinationRequest::MonitorExecution { plan_id: p.plan_id };
                self.coordinate(request, p.requested_by.as_deref()).await
            }
            Operation::RegisterAgent(dto) => {
                let agent = self
                    .coordinator
                    .register_agent(AgentInfo::from_protocol(dto)?)
                    .await?;
                to_json(agent.to_protocol())
            }
            Operation::UnregisterAgent(p) => {
                let outcome = self.coordinator.unregister_agent(&p.agent_id).await?;
                Ok(json!({
                    "agent": outcome.agent.to_protocol(),
                    "reassigned": outcome.reassigned.iter().map(ToProtocol::to_protocol).collect::<Vec<_>>(),
                    "failed": outcome.failed.iter().map(ToProtocol::to_protocol).collect::<Vec<_>>(),
                    "issues": outcome.issues,
                }))
            }
            Operation::StartTask(p) => to_json(self.coordinator.start_task(&p.task_id).await?.to_protocol()),
            Operation::CompleteTask(p) => {
                to_json(self.coordinator.complete_task(&p.task_id).await?.to_protocol())
            }
            Operation::FailTask(p) => {
                let reason = p.reason.as_deref().unwrap_or("reported failed");
                to_json(self.coordinator.fail_task(&p.task_id, reason).await?.to_protocol())
            }
        }
    }

    async fn query(&self, p: QueryPayload) -> Result<Value> {
        if let Some(user_id) = &p.user_id {
            self.gate
                .auditor()
                .require_permission(user_id, &PermissionTarget::Resource("confirm:list".into()), "confirm:read")
                .await?;
        }
        let mut filter = Filter::new();
        for (field, value) in p.filter {
            filter = filter.eq(snake_case(&field), value);
        }
        let mut pagination = Pagination::default();
        if let Some(offset) = p.offset {
            pagination.offset = offset;
        }
        if let Some(limit) = p.limit {
            pagination.limit = limit;
        }

        let page = self.gate.query(&filter, pagination).await?;
        Ok(json!({
            "items": page.items.iter().map(ToProtocol::to_protocol).collect::<Vec<_>>(),
            "total": page.total,
            "offset": page.offset,
            "limit": page.limit,
        }))
    }

    async fn coordinate(&self, request: CoordinationRequest, actor: Option<&str>) -> Result<Value> {
        let result = self.coordinator.process(request, actor).await?;
        Ok(coordination_json(&result))
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn coordination_json(result: &CoordinationResult) -> Value {
    json!({
        "assignments": result.assignments.iter().map(ToProtocol::to_protocol).collect::<Vec<_>>(),
        "allocation": result.allocation,
        "conflicts": result.conflicts,
        "resolutions": result.resolutions,
        "progress": result.progress,
    })
}

/// `contextId` -> `context_id`
fn snake_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 4);
    for c in field.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snake_case_fields() {
        assert_eq!(snake_case("contextId"), "context_id");
        assert_eq!(snake_case("status"), "status");
        assert_eq!(snake_case("requestedBy"), "requested_by");
    }
}
