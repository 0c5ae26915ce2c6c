//! Confirm requests and their approval workflow.
//!
//! The request status follows a fixed transition table; every mutation goes
//! through [`ConfirmRequest::transition_to`] so an illegal move can never be
//! written. Step decisions are recorded exactly once.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoordError, Result};

use super::agent::Priority;
use super::audit::RiskLevel;

/// Status of a confirm request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmStatus {
    #[default]
    Pending,
    InReview,
    Approved,
    Rejected,
    Cancelled,
    Expired,
    Escalated,
}

impl ConfirmStatus {
    /// Statuses reachable in one step
    pub fn allowed_transitions(&self) -> &'static [ConfirmStatus] {
        use ConfirmStatus::*;
        match self {
            Pending => &[InReview, Cancelled, Expired],
            InReview => &[Approved, Rejected, Escalated, Cancelled],
            Escalated => &[InReview, Approved, Rejected],
            Approved | Rejected | Cancelled | Expired => &[],
        }
    }

    pub fn can_transition_to(&self, next: ConfirmStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Still waiting on approvers
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InReview)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InReview => "in_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_review" => Some(Self::InReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

impl fmt::Display for ConfirmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approver {
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

impl Approver {
    pub fn required(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            is_required: true,
            delegation_allowed: false,
        }
    }

    pub fn optional(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            is_required: false,
            ..Self::required(user_id, role)
        }
    }

    pub fn delegable(mut self) -> Self {
        self.delegation_allowed = true;
        self
    }
}

/// Status of a single approval step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Approve,
    Reject,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }

    fn step_status(&self) -> ApprovalStatus {
        match self {
            Self::Approve => ApprovalStatus::Approved,
            Self::Reject => ApprovalStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub decided_by: String,
    pub timestamp: DateTime<Utc>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub step_id: Uuid,
    pub name: String,
    pub approver: Approver,
    pub status: ApprovalStatus,
    pub decision: Option<Decision>,
    /// Previous approvers, oldest first
    #[serde(default)]
    pub delegated_from: Vec<String>,
}

impl ApprovalStep {
    pub fn new(name: impl Into<String>, approver: Approver) -> Self {
        Self {
            step_id: Uuid::new_v4(),
            name: name.into(),
            approver,
            status: ApprovalStatus::Pending,
            decision: None,
            delegated_from: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Steps are decided in order
    Sequential,
    /// Any pending step may be decided
    #[default]
    Parallel,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sequential" => Some(Self::Sequential),
            "parallel" => Some(Self::Parallel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Idle time in review before the request is escalated
    pub timeout_secs: u64,
    /// Users who may resolve an escalated request
    pub escalate_to: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    #[serde(default)]
    pub kind: WorkflowKind,
    pub steps: Vec<ApprovalStep>,
    #[serde(default)]
    pub escalation: Option<EscalationPolicy>,
}

/// One line of a request's own append-only history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailEntry {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub action: String,
    pub details: Option<String>,
}

/// Input for creating a confirm request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConfirm {
    pub context_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub risk_level: RiskLevel,
    pub requested_by: String,
    #[serde(default)]
    pub kind: WorkflowKind,
    pub approvers: Vec<Approver>,
    #[serde(default)]
    pub escalation: Option<EscalationPolicy>,
    /// Pending requests expire after this many seconds
    #[serde(default)]
    pub expires_in_secs: Option<u64>,
}

/// A confirmable artifact awaiting multi-step sign-off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub confirm_id: Uuid,
    pub context_id: String,
    pub plan_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub risk_level: RiskLevel,
    pub requested_by: String,
    pub status: ConfirmStatus,
    pub approval_workflow: ApprovalWorkflow,
    pub audit_trail: Vec<TrailEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ConfirmRequest {
    /// Validate a submission and build the request in `pending`
    pub fn create(input: NewConfirm) -> Result<Self> {
        if input.context_id.trim().is_empty() {
            return Err(CoordError::Validation("context_id is required".into()));
        }
        if input.requested_by.trim().is_empty() {
            return Err(CoordError::Validation("requested_by is required".into()));
        }
        if input.approvers.is_empty() {
            return Err(CoordError::Validation(
                "approval workflow needs at least one step".into(),
            ));
        }
        let mut seen = HashSet::new();
        for approver in &input.approvers {
            if approver.user_id.trim().is_empty() {
                return Err(CoordError::Validation("approver user_id is required".into()));
            }
            if !seen.insert(approver.user_id.as_str()) {
                return Err(CoordError::Validation(format!(
                    "approver '{}' appears more than once",
                    approver.user_id
                )));
            }
        }

        if let Some(escalation) = &input.escalation {
            if seconds_after(Utc::now(), escalation.timeout_secs).is_none() {
                return Err(CoordError::Validation(format!(
                    "escalation timeout of {}s is out of range",
                    escalation.timeout_secs
                )));
            }
        }

        let now = Utc::now();
        let expires_at = match input.expires_in_secs {
            Some(secs) => Some(seconds_after(now, secs).ok_or_else(|| {
                CoordError::Validation(format!("expiry of {}s is out of range", secs))
            })?),
            None => None,
        };
        let steps = input
            .approvers
            .into_iter()
            .enumerate()
            .map(|(i, approver)| ApprovalStep::new(format!("step-{}", i + 1), approver))
            .collect();

        let mut request = Self {
            confirm_id: Uuid::new_v4(),
            context_id: input.context_id,
            plan_id: input.plan_id,
            title: input.title,
            description: input.description,
            priority: input.priority,
            risk_level: input.risk_level,
            requested_by: input.requested_by.clone(),
            status: ConfirmStatus::Pending,
            approval_workflow: ApprovalWorkflow {
                kind: input.kind,
                steps,
                escalation: input.escalation,
            },
            audit_trail: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at,
        };
        request.append_trail(&input.requested_by, "submit", None);
        Ok(request)
    }

    /// Move to `next` if the transition table allows it
    pub fn transition_to(&mut self, next: ConfirmStatus, actor: &str) -> Result<ConfirmStatus> {
        let previous = self.status;
        if !previous.can_transition_to(next) {
            return Err(CoordError::transition(previous, next));
        }
        self.status = next;
        self.append_trail(
            actor,
            "status_change",
            Some(format!("{} -> {}", previous, next)),
        );
        Ok(previous)
    }

    pub fn append_trail(&mut self, user_id: &str, action: &str, details: Option<String>) {
        let now = Utc::now();
        self.audit_trail.push(TrailEntry {
            entry_id: Uuid::new_v4(),
            timestamp: now,
            user_id: user_id.to_string(),
            action: action.to_string(),
            details,
        });
        self.updated_at = now;
    }

    pub fn steps(&self) -> &[ApprovalStep] {
        &self.approval_workflow.steps
    }

    pub fn step(&self, step_id: Uuid) -> Option<&ApprovalStep> {
        self.steps().iter().find(|s| s.step_id == step_id)
    }

    /// Steps before `idx` are all approved (always true for parallel workflows)
    fn is_turn(&self, idx: usize) -> bool {
        match self.approval_workflow.kind {
            WorkflowKind::Parallel => true,
            WorkflowKind::Sequential => self.steps()[..idx]
                .iter()
                .all(|s| s.status == ApprovalStatus::Approved),
        }
    }

    /// True iff the request is open and `user_id` owns a pending step it may decide now
    pub fn can_approve(&self, user_id: &str) -> bool {
        self.status.is_open()
            && self.steps().iter().enumerate().any(|(idx, step)| {
                step.approver.user_id == user_id
                    && step.status == ApprovalStatus::Pending
                    && self.is_turn(idx)
            })
    }

    /// Every required step is approved
    pub fn are_all_required_steps_completed(&self) -> bool {
        self.steps()
            .iter()
            .filter(|s| s.approver.is_required)
            .all(|s| s.status == ApprovalStatus::Approved)
    }

    fn any_rejected(&self, required_only: bool) -> bool {
        self.steps().iter().any(|s| {
            s.status == ApprovalStatus::Rejected && (!required_only || s.approver.is_required)
        })
    }

    /// Record one approver's decision and recompute the aggregate status
    pub fn record_decision(
        &mut self,
        step_id: Uuid,
        user_id: &str,
        outcome: Outcome,
        comments: Option<String>,
    ) -> Result<ConfirmStatus> {
        if !self.status.is_open() {
            return Err(CoordError::transition(self.status, "decision"));
        }
        let idx = self
            .steps()
            .iter()
            .position(|s| s.step_id == step_id)
            .ok_or_else(|| CoordError::not_found("ApprovalStep", step_id))?;
        let step = &self.steps()[idx];
        if step.status != ApprovalStatus::Pending {
            return Err(CoordError::transition(step.status.as_str(), outcome.as_str()));
        }
        if step.approver.user_id != user_id {
            return Err(CoordError::PermissionDenied(format!(
                "user '{}' is not the approver of step '{}'",
                user_id, step.name
            )));
        }
        if !self.is_turn(idx) {
            return Err(CoordError::Validation(format!(
                "step '{}' cannot be decided before earlier steps are approved",
                step.name
            )));
        }

        if self.status == ConfirmStatus::Pending {
            self.transition_to(ConfirmStatus::InReview, user_id)?;
        }

        let step = &mut self.approval_workflow.steps[idx];
        step.status = outcome.step_status();
        step.decision = Some(Decision {
            outcome,
            decided_by: user_id.to_string(),
            timestamp: Utc::now(),
            comments: comments.clone(),
        });
        let step_name = step.name.clone();
        self.append_trail(
            user_id,
            outcome.as_str(),
            Some(comments.map_or(step_name.clone(), |c| format!("{}: {}", step_name, c))),
        );

        if self.any_rejected(true) {
            self.transition_to(ConfirmStatus::Rejected, user_id)?;
        } else if self.are_all_required_steps_completed() && !self.any_rejected(false) {
            self.transition_to(ConfirmStatus::Approved, user_id)?;
        }
        Ok(self.status)
    }

    /// Hand a pending step to another user
    pub fn delegate(&mut self, step_id: Uuid, from: &str, to: &str, reason: Option<String>) -> Result<()> {
        if !self.status.is_open() {
            return Err(CoordError::transition(self.status, "delegation"));
        }
        if to.trim().is_empty() {
            return Err(CoordError::Validation("delegate target is required".into()));
        }
        if self.steps().iter().any(|s| s.approver.user_id == to) {
            return Err(CoordError::Validation(format!(
                "user '{}' already owns a step",
                to
            )));
        }
        let step = self
            .approval_workflow
            .steps
            .iter_mut()
            .find(|s| s.step_id == step_id)
            .ok_or_else(|| CoordError::not_found("ApprovalStep", step_id))?;
        if step.approver.user_id != from {
            return Err(CoordError::PermissionDenied(format!(
                "user '{}' is not the approver of step '{}'",
                from, step.name
            )));
        }
        if !step.approver.delegation_allowed {
            return Err(CoordError::PermissionDenied(format!(
                "step '{}' does not allow delegation",
                step.name
            )));
        }
        if step.status != ApprovalStatus::Pending {
            return Err(CoordError::transition(step.status.as_str(), "delegated"));
        }
        step.delegated_from.push(from.to_string());
        step.approver.user_id = to.to_string();
        let detail = match reason {
            Some(reason) => format!("{} -> {}: {}", from, to, reason),
            None => format!("{} -> {}", from, to),
        };
        self.append_trail(from, "delegate", Some(detail));
        Ok(())
    }

    /// Decide an escalated request directly
    pub fn resolve_escalation(
        &mut self,
        user_id: &str,
        outcome: Outcome,
        comments: Option<String>,
    ) -> Result<ConfirmStatus> {
        if self.status != ConfirmStatus::Escalated {
            return Err(CoordError::transition(self.status, outcome.step_status().as_str()));
        }
        if !self.is_escalation_authority(user_id) {
            return Err(CoordError::PermissionDenied(format!(
                "user '{}' is not an escalation authority",
                user_id
            )));
        }
        self.append_trail(user_id, outcome.as_str(), comments);
        let next = match outcome {
            Outcome::Approve => ConfirmStatus::Approved,
            Outcome::Reject => ConfirmStatus::Rejected,
        };
        self.transition_to(next, user_id)?;
        Ok(self.status)
    }

    pub fn is_escalation_authority(&self, user_id: &str) -> bool {
        self.approval_workflow
            .escalation
            .as_ref()
            .map(|e| e.escalate_to.iter().any(|u| u == user_id))
            .unwrap_or(false)
    }

    /// Requester, approver (current or former), or escalation authority
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.requested_by == user_id
            || self.steps().iter().any(|s| {
                s.approver.user_id == user_id || s.delegated_from.iter().any(|u| u == user_id)
            })
            || self.is_escalation_authority(user_id)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ConfirmStatus::Pending
            && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// In review with no activity for the escalation timeout
    pub fn is_stalled(&self, now: DateTime<Utc>, default_timeout_secs: u64) -> bool {
        let timeout = self
            .approval_workflow
            .escalation
            .as_ref()
            .map(|e| e.timeout_secs)
            .unwrap_or(default_timeout_secs);
        self.status == ConfirmStatus::InReview
            && seconds_after(self.updated_at, timeout)
                .map(|deadline| deadline <= now)
                .unwrap_or(false)
    }
}

/// `at + secs`, or None when the sum leaves chrono's range
pub fn seconds_after(at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    at.checked_add_signed(ChronoDuration::try_seconds(secs)?)
}
