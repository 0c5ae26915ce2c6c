//! Operations accepted at the protocol boundary.
//!
//! Each operation has one fixed payload shape. The envelope's untyped
//! payload is parsed into an [`Operation`] exactly once; unknown operation
//! names and payloads that do not fit are validation errors.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{CoordError, Result};

use super::mapper::{AgentDto, ConflictDto, CreateConfirmDto, ResourceDemandDto, TaskSpecDto};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPayload {
    pub confirm_id: Uuid,
    pub step_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegatePayload {
    pub confirm_id: Uuid,
    pub step_id: Uuid,
    pub from_user_id: String,
    pub to_user_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A user acting on one confirm request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorPayload {
    pub confirm_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveEscalationPayload {
    pub confirm_id: Uuid,
    pub user_id: String,
    pub outcome: String,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub confirm_id: Uuid,
    pub user_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPayload {
    pub confirm_id: Uuid,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    /// Equality matches on top-level fields of the stored request
    #[serde(default)]
    pub filter: Map<String, Value>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignTasksPayload {
    pub plan_id: String,
    pub tasks: Vec<TaskSpecDto>,
    #[serde(default)]
    pub candidate_agents: Option<Vec<String>>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReallocatePayload {
    pub resource_id: String,
    #[serde(default)]
    pub demands: Vec<ResourceDemandDto>,
    #[serde(default)]
    pub capacity: Option<u64>,
    #[serde(default)]
    pub allow_partial: Option<bool>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictPayload {
    pub conflicts: Vec<ConflictDto>,
    #[serde(default)]
    pub tasks: Vec<TaskSpecDto>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorPayload {
    pub plan_id: String,
    #[serde(default)]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdPayload {
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdPayload {
    pub task_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    Create(CreateConfirmDto),
    Approve(DecisionPayload),
    Reject(DecisionPayload),
    Delegate(DelegatePayload),
    Escalate(ActorPayload),
    Resume(ActorPayload),
    ResolveEscalation(ResolveEscalationPayload),
    Cancel(ActorPayload),
    Update(UpdatePayload),
    Delete(ActorPayload),
    Get(GetPayload),
    List(QueryPayload),
    Query(QueryPayload),
    AssignTasks(AssignTasksPayload),
    ReallocateResources(ReallocatePayload),
    ResolveConflict(ResolveConflictPayload),
    MonitorExecution(MonitorPayload),
    RegisterAgent(AgentDto),
    UnregisterAgent(AgentIdPayload),
    StartTask(TaskIdPayload),
    CompleteTask(TaskIdPayload),
    FailTask(TaskIdPayload),
}

impl Operation {
    pub const NAMES: &'static [&'static str] = &[
        "create",
        "approve",
        "reject",
        "delegate",
        "escalate",
        "resume",
        "resolve_escalation",
        "cancel",
        "update",
        "delete",
        "get",
        "list",
        "query",
        "assign_tasks",
        "reallocate_resources",
        "resolve_conflict",
        "monitor_execution",
        "register_agent",
        "unregister_agent",
        "start_task",
        "complete_task",
        "fail_task",
    ];

    /// Parse an operation name and its payload
    pub fn parse(operation: &str, payload: Value) -> Result<Self> {
        if !Self::NAMES.contains(&operation) {
            return Err(CoordError::Validation(format!(
                "unknown operation '{}'",
                operation
            )));
        }
        // `list` is the only operation whose payload may be omitted
        let payload = match payload {
            Value::Null if operation == "list" => json!({}),
            other => other,
        };
        serde_json::from_value(json!({ "operation": operation, "payload": payload })).map_err(
            |e| CoordError::Validation(format!("invalid payload for '{}': {}", operation, e)),
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Approve(_) => "approve",
            Self::Reject(_) => "reject",
            Self::Delegate(_) => "delegate",
            Self::Escalate(_) => "escalate",
            Self::Resume(_) => "resume",
            Self::ResolveEscalation(_) => "resolve_escalation",
            Self::Cancel(_) => "cancel",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
            Self::Get(_) => "get",
            Self::List(_) => "list",
            Self::Query(_) => "query",
            Self::AssignTasks(_) => "assign_tasks",
            Self::ReallocateResources(_) => "reallocate_resources",
            Self::ResolveConflict(_) => "resolve_conflict",
            Self::MonitorExecution(_) => "monitor_execution",
            Self::RegisterAgent(_) => "register_agent",
            Self::UnregisterAgent(_) => "unregister_agent",
            Self::StartTask(_) => "start_task",
            Self::CompleteTask(_) => "complete_task",
            Self::FailTask(_) => "fail_task",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_approve() {
        let confirm_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();
        let op = Operation::parse(
            "approve",
            json!({ "confirmId": confirm_id, "stepId": step_id, "userId": "alice" }),
        )
        .unwrap();

        assert_eq!(op.name(), "approve");
        assert!(matches!(op, Operation::Approve(p) if p.user_id == "alice" && p.step_id == step_id));
    }

    #[test]
    fn test_unknown_operation() {
        let err = Operation::parse("launch", json!({})).unwrap_err();
        assert!(matches!(err, CoordError::Validation(msg) if msg.contains("launch")));
    }

    #[test]
    fn test_malformed_payload() {
        let err = Operation::parse("get", json!({ "confirmId": "not-a-uuid" })).unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));

        let err = Operation::parse("assign_tasks", json!({ "tasks": [] })).unwrap_err();
        assert!(matches!(err, CoordError::Validation(_)));
    }

    #[test]
    fn test_list_without_payload() {
        let op = Operation::parse("list", Value::Null).unwrap();
        assert!(matches!(op, Operation::List(_)));
    }

    #[test]
    fn test_names_cover_variants() {
        for name in Operation::NAMES {
            let err = Operation::parse(name, json!("wrong shape")).unwrap_err();
            assert!(!matches!(err, CoordError::Validation(ref m) if m.starts_with("unknown")));
        }
    }
}
