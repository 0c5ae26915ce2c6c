//! Wire DTOs and the mappers between them and domain types.
//!
//! DTOs use camelCase field names and carry enums as plain strings;
//! `from_protocol` parses those strings and rejects unknown values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    AgentInfo, ApprovalStatus, ApprovalStep, ApprovalWorkflow, Approver, AssignmentStatus,
    ConfirmRequest, ConfirmStatus, Conflict, ConflictType, Decision, EscalationPolicy, NewConfirm,
    Outcome, Priority, ResourceDemand, RiskLevel, Severity, TaskAssignment, TaskSpec, TrailEntry,
    WorkflowKind,
};
use crate::error::{CoordError, Result};

/// Domain value -> wire DTO
pub trait ToProtocol {
    type Dto: Serialize;

    fn to_protocol(&self) -> Self::Dto;
}

/// Wire DTO -> domain value, validating enum strings
pub trait FromProtocol: Sized {
    type Dto;

    fn from_protocol(dto: Self::Dto) -> Result<Self>;
}

fn parse_enum<T>(field: &str, value: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T> {
    parse(value).ok_or_else(|| {
        CoordError::Validation(format!("invalid {} '{}'", field, value))
    })
}

fn parse_priority(value: Option<&str>) -> Result<Priority> {
    value.map_or(Ok(Priority::default()), |v| parse_enum("priority", v, Priority::parse))
}

// ---------------------------------------------------------------------------
// Confirm requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproverDto {
    pub user_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default = "default_true")]
    pub is_required: bool,
    #[serde(default)]
    pub delegation_allowed: bool,
}

fn default_true() -> bool {
    true
}

impl ToProtocol for Approver {
    type Dto = ApproverDto;

    fn to_protocol(&self) -> ApproverDto {
        ApproverDto {
            user_id: self.user_id.clone(),
            role: self.role.clone(),
            is_required: self.is_required,
            delegation_allowed: self.delegation_allowed,
        }
    }
}

impl FromProtocol for Approver {
    type Dto = ApproverDto;

    fn from_protocol(dto: ApproverDto) -> Result<Self> {
        Ok(Self {
            user_id: dto.user_id,
            role: dto.role,
            is_required: dto.is_required,
            delegation_allowed: dto.delegation_allowed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionDto {
    pub outcome: String,
    pub decided_by: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStepDto {
    pub step_id: Uuid,
    pub name: String,
    pub approver: ApproverDto,
    pub status: String,
    #[serde(default)]
    pub decision: Option<DecisionDto>,
    #[serde(default)]
    pub delegated_from: Vec<String>,
}

impl ToProtocol for ApprovalStep {
    type Dto = ApprovalStepDto;

    fn to_protocol(&self) -> ApprovalStepDto {
        ApprovalStepDto {
            step_id: self.step_id,
            name: self.name.clone(),
            approver: self.approver.to_protocol(),
            status: self.status.as_str().to_string(),
            decision: self.decision.as_ref().map(|d| DecisionDto {
                outcome: d.outcome.as_str().to_string(),
                decided_by: d.decided_by.clone(),
                timestamp: d.timestamp,
                comments: d.comments.clone(),
            }),
            delegated_from: self.delegated_from.clone(),
        }
    }
}

impl FromProtocol for ApprovalStep {
    type Dto = ApprovalStepDto;

    fn from_protocol(dto: ApprovalStepDto) -> Result<Self> {
        let decision = match dto.decision {
            Some(d) => Some(Decision {
                outcome: parse_enum("outcome", &d.outcome, Outcome::parse)?,
                decided_by: d.decided_by,
                timestamp: d.timestamp,
                comments: d.comments,
            }),
            None => None,
        };
        Ok(Self {
            step_id: dto.step_id,
            name: dto.name,
            approver: Approver::from_protocol(dto.approver)?,
            status: parse_enum("step status", &dto.status, ApprovalStatus::parse)?,
            decision,
            delegated_from: dto.delegated_from,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationDto {
    pub timeout_secs: u64,
    pub escalate_to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalWorkflowDto {
    pub kind: String,
    pub steps: Vec<ApprovalStepDto>,
    #[serde(default)]
    pub escalation: Option<EscalationDto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailEntryDto {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: String,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequestDto {
    pub confirm_id: Uuid,
    pub context_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: String,
    pub risk_level: String,
    pub requested_by: String,
    pub status: String,
    pub approval_workflow: ApprovalWorkflowDto,
    #[serde(default)]
    pub audit_trail: Vec<TrailEntryDto>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ToProtocol for ConfirmRequest {
    type Dto = ConfirmRequestDto;

    fn to_protocol(&self) -> ConfirmRequestDto {
        let workflow = &self.approval_workflow;
        ConfirmRequestDto {
            confirm_id: self.confirm_id,
            context_id: self.context_id.clone(),
            plan_id: self.plan_id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            priority: self.priority.as_str().to_string(),
            risk_level: self.risk_level.as_str().to_string(),
            requested_by: self.requested_by.clone(),
            status: self.status.as_str().to_string(),
            approval_workflow: ApprovalWorkflowDto {
                kind: workflow.kind.as_str().to_string(),
                steps: workflow.steps.iter().map(ToProtocol::to_protocol).collect(),
                escalation: workflow.escalation.as_ref().map(|e| EscalationDto {
                    timeout_secs: e.timeout_secs,
                    escalate_to: e.escalate_to.clone(),
                }),
            },
            audit_trail: self
                .audit_trail
                .iter()
                .map(|e| TrailEntryDto {
                    entry_id: e.entry_id,
                    timestamp: e.timestamp,
                    user_id: e.user_id.clone(),
                    action: e.action.clone(),
                    details: e.details.clone(),
                })
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        }
    }
}

impl FromProtocol for ConfirmRequest {
    type Dto = ConfirmRequestDto;

    fn from_protocol(dto: ConfirmRequestDto) -> Result<Self> {
        let workflow = dto.approval_workflow;
        let steps = workflow
            .steps
            .into_iter()
            .map(ApprovalStep::from_protocol)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            confirm_id: dto.confirm_id,
            context_id: dto.context_id,
            plan_id: dto.plan_id,
            title: dto.title,
            description: dto.description,
            priority: parse_priority(Some(&dto.priority))?,
            risk_level: parse_enum("risk level", &dto.risk_level, RiskLevel::parse)?,
            requested_by: dto.requested_by,
            status: parse_enum("status", &dto.status, ConfirmStatus::parse)?,
            approval_workflow: ApprovalWorkflow {
                kind: parse_enum("workflow kind", &workflow.kind, WorkflowKind::parse)?,
                steps,
                escalation: workflow.escalation.map(|e| EscalationPolicy {
                    timeout_secs: e.timeout_secs,
                    escalate_to: e.escalate_to,
                }),
            },
            audit_trail: dto
                .audit_trail
                .into_iter()
                .map(|e| TrailEntry {
                    entry_id: e.entry_id,
                    timestamp: e.timestamp,
                    user_id: e.user_id,
                    action: e.action,
                    details: e.details,
                })
                .collect(),
            created_at: dto.created_at,
            updated_at: dto.updated_at,
            expires_at: dto.expires_at,
        })
    }
}

/// Payload of the `create` operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConfirmDto {
    pub context_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub risk_level: Option<String>,
    pub requested_by: String,
    #[serde(default)]
    pub kind: Option<String>,
    pub approvers: Vec<ApproverDto>,
    #[serde(default)]
    pub escalation: Option<EscalationDto>,
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
}

impl FromProtocol for NewConfirm {
    type Dto = CreateConfirmDto;

    fn from_protocol(dto: CreateConfirmDto) -> Result<Self> {
        Ok(Self {
            context_id: dto.context_id,
            plan_id: dto.plan_id,
            title: dto.title,
            description: dto.description,
            priority: parse_priority(dto.priority.as_deref())?,
            risk_level: dto
                .risk_level
                .as_deref()
                .map_or(Ok(RiskLevel::default()), |v| {
                    parse_enum("risk level", v, RiskLevel::parse)
                })?,
            requested_by: dto.requested_by,
            kind: dto
                .kind
                .as_deref()
                .map_or(Ok(WorkflowKind::default()), |v| {
                    parse_enum("workflow kind", v, WorkflowKind::parse)
                })?,
            approvers: dto
                .approvers
                .into_iter()
                .map(Approver::from_protocol)
                .collect::<Result<Vec<_>>>()?,
            escalation: dto.escalation.map(|e| EscalationPolicy {
                timeout_secs: e.timeout_secs,
                escalate_to: e.escalate_to,
            }),
            expires_in_secs: dto.expires_in_secs,
        })
    }
}

// ---------------------------------------------------------------------------
// Tasks and agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignmentDto {
    pub task_id: String,
    pub agent_id: String,
    pub plan_id: String,
    pub priority: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: String,
    pub assigned_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub expected_duration_ms: Option<u64>,
}

impl ToProtocol for TaskAssignment {
    type Dto = TaskAssignmentDto;

    fn to_protocol(&self) -> TaskAssignmentDto {
        TaskAssignmentDto {
            task_id: self.task_id.clone(),
            agent_id: self.agent_id.clone(),
            plan_id: self.plan_id.clone(),
            priority: self.priority.as_str().to_string(),
            requirements: self.requirements.clone(),
            dependencies: self.dependencies.iter().cloned().collect(),
            status: self.status.as_str().to_string(),
            assigned_at: self.assigned_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
            expected_duration_ms: self.expected_duration_ms,
        }
    }
}

impl FromProtocol for TaskAssignment {
    type Dto = TaskAssignmentDto;

    fn from_protocol(dto: TaskAssignmentDto) -> Result<Self> {
        Ok(Self {
            task_id: dto.task_id,
            agent_id: dto.agent_id,
            plan_id: dto.plan_id,
            priority: parse_priority(Some(&dto.priority))?,
            requirements: dto.requirements,
            dependencies: dto.dependencies.into_iter().collect(),
            status: parse_enum("task status", &dto.status, AssignmentStatus::parse)?,
            assigned_at: dto.assigned_at,
            started_at: dto.started_at,
            completed_at: dto.completed_at,
            updated_at: dto.updated_at,
            expected_duration_ms: dto.expected_duration_ms,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpecDto {
    pub task_id: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub expected_duration_ms: Option<u64>,
}

impl FromProtocol for TaskSpec {
    type Dto = TaskSpecDto;

    fn from_protocol(dto: TaskSpecDto) -> Result<Self> {
        Ok(Self {
            task_id: dto.task_id,
            requirements: dto.requirements,
            priority: parse_priority(dto.priority.as_deref())?,
            dependencies: dto.dependencies.into_iter().collect(),
            expected_duration_ms: dto.expected_duration_ms,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDto {
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_load: u32,
    pub max_concurrent_tasks: u32,
}

impl ToProtocol for AgentInfo {
    type Dto = AgentDto;

    fn to_protocol(&self) -> AgentDto {
        let status = serde_json::to_value(self.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
        AgentDto {
            agent_id: self.agent_id.clone(),
            capabilities: self.capabilities.iter().cloned().collect(),
            status,
            current_load: self.current_load,
            max_concurrent_tasks: self.max_concurrent_tasks,
        }
    }
}

impl FromProtocol for AgentInfo {
    type Dto = AgentDto;

    /// Registration input; load and status are owned by the registry
    fn from_protocol(dto: AgentDto) -> Result<Self> {
        Ok(AgentInfo::new(dto.agent_id, dto.capabilities, dto.max_concurrent_tasks))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDemandDto {
    pub agent_id: String,
    pub task_id: String,
    pub amount: u64,
    #[serde(default)]
    pub priority: Option<String>,
}

impl FromProtocol for ResourceDemand {
    type Dto = ResourceDemandDto;

    fn from_protocol(dto: ResourceDemandDto) -> Result<Self> {
        Ok(Self {
            agent_id: dto.agent_id,
            task_id: dto.task_id,
            amount: dto.amount,
            priority: parse_priority(dto.priority.as_deref())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDto {
    #[serde(default)]
    pub conflict_id: Option<Uuid>,
    pub conflict_type: String,
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub description: String,
}

fn parse_conflict_type(value: &str) -> Option<ConflictType> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
}

fn parse_severity(value: &str) -> Option<Severity> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
}

impl FromProtocol for Conflict {
    type Dto = ConflictDto;

    fn from_protocol(dto: ConflictDto) -> Result<Self> {
        let conflict_type = parse_enum("conflict type", &dto.conflict_type, parse_conflict_type)?;
        let severity = dto
            .severity
            .as_deref()
            .map_or(Ok(Severity::Medium), |v| parse_enum("severity", v, parse_severity))?;
        let mut conflict = Conflict::new(conflict_type, dto.task_ids, severity, dto.description);
        if let Some(id) = dto.conflict_id {
            conflict.conflict_id = id;
        }
        Ok(conflict)
    }
}
