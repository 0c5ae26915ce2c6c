//! Approval gate.
//!
//! Owns confirm requests: submission, per-step decisions, delegation,
//! escalation, and the sweeps that expire or escalate idle requests. Every
//! mutation of one request runs under that request's lock, so concurrent
//! decisions on different steps are applied one after the other and the
//! aggregate status is computed from both.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{EventBus, Filter, Page, Pagination, Repository};
use crate::domain::audit::actions;
use crate::domain::{
    AuditEntry, AuditResult, ConfirmRequest, ConfirmStatus, Event, EventType, NewConfirm, Outcome,
    Priority, RiskLevel,
};
use crate::error::{CoordError, Result};

use super::security::{assess_risk_level, PermissionTarget, SecurityAuditor};

const SYSTEM_ACTOR: &str = "system";

/// Upper bound on a single wait for resolution
const MAX_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSettings {
    /// Idle time in review before a request is escalated, unless its policy says otherwise
    #[serde(default = "default_escalation_timeout_secs")]
    pub escalation_timeout_secs: u64,

    /// Applied to submissions that carry no expiry
    #[serde(default)]
    pub default_expires_in_secs: Option<u64>,
}

fn default_escalation_timeout_secs() -> u64 {
    24 * 60 * 60
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            escalation_timeout_secs: default_escalation_timeout_secs(),
            default_expires_in_secs: None,
        }
    }
}

/// Fields a requester may change after submission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfirmUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub status: Option<ConfirmStatus>,
}

pub struct ApprovalGate {
    confirms: Arc<dyn Repository<ConfirmRequest>>,
    auditor: Arc<SecurityAuditor>,
    events: Arc<dyn EventBus>,
    settings: ApprovalSettings,
    locks: Mutex<HashMap<Uuid, Weak<Mutex<()>>>>,
    changed: Notify,
}

impl ApprovalGate {
    pub fn new(
        confirms: Arc<dyn Repository<ConfirmRequest>>,
        auditor: Arc<SecurityAuditor>,
        events: Arc<dyn EventBus>,
        settings: ApprovalSettings,
    ) -> Self {
        Self {
            confirms,
            auditor,
            events,
            settings,
            locks: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    pub fn settings(&self) -> &ApprovalSettings {
        &self.settings
    }

    pub fn auditor(&self) -> &Arc<SecurityAuditor> {
        &self.auditor
    }

    /// Validate and store a new request in `pending`
    pub async fn submit(&self, mut input: NewConfirm) -> Result<ConfirmRequest> {
        self.auditor
            .require_permission(
                &input.requested_by,
                &PermissionTarget::Resource(format!("context:{}", input.context_id)),
                "confirm:create",
            )
            .await?;

        if input.expires_in_secs.is_none() {
            input.expires_in_secs = self.settings.default_expires_in_secs;
        }
        let request = ConfirmRequest::create(input)?;
        self.confirms.save(&request).await?;
        info!(
            confirm_id = %request.confirm_id,
            context_id = %request.context_id,
            steps = request.steps().len(),
            "Confirm request submitted"
        );

        self.audit(
            &request,
            &request.requested_by,
            actions::SUBMIT,
            RiskLevel::Low,
            json!({ "context_id": request.context_id, "title": request.title }),
        )
        .await?;
        self.publish(
            Event::entity(
                request.confirm_id.to_string(),
                EventType::ConfirmSubmitted,
                format!("Confirm request '{}' submitted", request.title),
            )
            .with_data(json!({ "context_id": request.context_id })),
        )
        .await;
        Ok(request)
    }

    /// Record one approver's decision on one step
    #[instrument(skip(self, comments), fields(outcome = %outcome.as_str()))]
    pub async fn decide(
        &self,
        confirm_id: Uuid,
        step_id: Uuid,
        user_id: &str,
        outcome: Outcome,
        comments: Option<String>,
    ) -> Result<ConfirmRequest> {
        let action = decision_action(outcome);
        self.authorize(user_id, confirm_id, &format!("confirm:{}", outcome.as_str()))
            .await?;

        let detail_comments = comments.clone();
        let request = self
            .mutate(confirm_id, user_id, |request| {
                request
                    .record_decision(step_id, user_id, outcome, comments)
                    .map(|_| ())
            })
            .await?;

        let risk = assess_risk_level(outcome, request.risk_level);
        self.audit(
            &request,
            user_id,
            action,
            risk,
            json!({ "step_id": step_id, "comments": detail_comments }),
        )
        .await?;
        self.publish(
            Event::entity(
                confirm_id.to_string(),
                EventType::ConfirmDecided,
                format!("{} {} step {}", user_id, action, step_id),
            )
            .with_data(json!({
                "step_id": step_id,
                "outcome": outcome.as_str(),
                "status": request.status.as_str(),
            })),
        )
        .await;
        self.flag_suspicious(confirm_id).await?;
        Ok(request)
    }

    /// Hand a pending step to another user
    pub async fn delegate(
        &self,
        confirm_id: Uuid,
        step_id: Uuid,
        from: &str,
        to: &str,
        reason: Option<String>,
    ) -> Result<ConfirmRequest> {
        self.authorize(from, confirm_id, "confirm:delegate").await?;
        let detail_reason = reason.clone();
        let request = self
            .mutate(confirm_id, from, |request| {
                request.delegate(step_id, from, to, reason)
            })
            .await?;

        self.audit(
            &request,
            from,
            actions::DELEGATE,
            RiskLevel::Low,
            json!({ "step_id": step_id, "to": to, "reason": detail_reason }),
        )
        .await?;
        self.publish(
            Event::entity(
                confirm_id.to_string(),
                EventType::ConfirmDelegated,
                format!("Step {} delegated from {} to {}", step_id, from, to),
            )
            .with_data(json!({ "step_id": step_id, "from": from, "to": to })),
        )
        .await;
        self.flag_suspicious(confirm_id).await?;
        Ok(request)
    }

    /// in_review -> escalated
    pub async fn escalate(
        &self,
        confirm_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<ConfirmRequest> {
        self.authorize(user_id, confirm_id, "confirm:escalate").await?;
        self.change_status(
            confirm_id,
            user_id,
            ConfirmStatus::Escalated,
            actions::ESCALATE,
            reason,
        )
        .await
    }

    /// escalated -> in_review; the acting user's permission is checked again
    pub async fn resume(&self, confirm_id: Uuid, user_id: &str) -> Result<ConfirmRequest> {
        self.authorize(user_id, confirm_id, "confirm:resume").await?;
        self.change_status(
            confirm_id,
            user_id,
            ConfirmStatus::InReview,
            actions::RESUME,
            None,
        )
        .await
    }

    /// Decide an escalated request as an escalation authority
    pub async fn resolve_escalation(
        &self,
        confirm_id: Uuid,
        user_id: &str,
        outcome: Outcome,
        comments: Option<String>,
    ) -> Result<ConfirmRequest> {
        self.authorize(user_id, confirm_id, &format!("confirm:{}", outcome.as_str()))
            .await?;
        let detail_comments = comments.clone();
        let request = self
            .mutate(confirm_id, user_id, |request| {
                request.resolve_escalation(user_id, outcome, comments).map(|_| ())
            })
            .await?;

        let risk = assess_risk_level(outcome, request.risk_level);
        self.audit(
            &request,
            user_id,
            decision_action(outcome),
            risk,
            json!({ "escalation": true, "comments": detail_comments }),
        )
        .await?;
        self.publish(
            Event::entity(
                confirm_id.to_string(),
                EventType::ConfirmDecided,
                format!("{} resolved escalation: {}", user_id, outcome.as_str()),
            )
            .with_data(json!({ "outcome": outcome.as_str(), "status": request.status.as_str() })),
        )
        .await;
        Ok(request)
    }

    /// pending|in_review -> cancelled
    pub async fn cancel(
        &self,
        confirm_id: Uuid,
        user_id: &str,
        reason: Option<String>,
    ) -> Result<ConfirmRequest> {
        self.authorize(user_id, confirm_id, "confirm:cancel").await?;
        self.change_status(
            confirm_id,
            user_id,
            ConfirmStatus::Cancelled,
            actions::CANCEL,
            reason,
        )
        .await
    }

    /// Expire every pending request whose `expires_at` has passed
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut expired = Vec::new();
        for candidate in self.with_status(ConfirmStatus::Pending).await? {
            if !candidate.is_overdue(now) {
                continue;
            }
            let lock = self.lock_for(candidate.confirm_id).await;
            let _guard = lock.lock().await;
            // Re-read under the lock; a decision may have landed meanwhile
            let mut request = self.get(candidate.confirm_id).await?;
            if !request.is_overdue(now) {
                continue;
            }
            request.transition_to(ConfirmStatus::Expired, SYSTEM_ACTOR)?;
            self.confirms.save(&request).await?;
            self.after_status_change(&request, ConfirmStatus::Pending, actions::EXPIRE, None)
                .await?;
            expired.push(request.confirm_id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired overdue confirm requests");
        }
        Ok(expired)
    }

    /// Escalate every in-review request idle for longer than its escalation timeout
    pub async fn escalate_stalled(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let timeout = self.settings.escalation_timeout_secs;
        let mut escalated = Vec::new();
        for candidate in self.with_status(ConfirmStatus::InReview).await? {
            if !candidate.is_stalled(now, timeout) {
                continue;
            }
            let lock = self.lock_for(candidate.confirm_id).await;
            let _guard = lock.lock().await;
            let mut request = self.get(candidate.confirm_id).await?;
            if !request.is_stalled(now, timeout) {
                continue;
            }
            request.transition_to(ConfirmStatus::Escalated, SYSTEM_ACTOR)?;
            self.confirms.save(&request).await?;
            self.after_status_change(
                &request,
                ConfirmStatus::InReview,
                actions::ESCALATE,
                Some("no activity before escalation timeout".to_string()),
            )
            .await?;
            escalated.push(request.confirm_id);
        }
        if !escalated.is_empty() {
            warn!(count = escalated.len(), "Escalated stalled confirm requests");
        }
        Ok(escalated)
    }

    /// Change descriptive fields, or cancel the request
    ///
    /// Decision outcomes are only reachable through `decide`, `escalate` and
    /// `resolve_escalation`.
    pub async fn update(
        &self,
        confirm_id: Uuid,
        user_id: &str,
        changes: ConfirmUpdate,
    ) -> Result<ConfirmRequest> {
        self.authorize(user_id, confirm_id, "confirm:update").await?;
        let details = serde_json::to_value(&changes)?;
        let request = self
            .mutate(confirm_id, user_id, |request| {
                if let Some(title) = changes.title {
                    if title.trim().is_empty() {
                        return Err(CoordError::Validation("title cannot be empty".into()));
                    }
                    request.title = title;
                }
                if changes.description.is_some() {
                    request.description = changes.description;
                }
                if let Some(priority) = changes.priority {
                    request.priority = priority;
                }
                if let Some(status) = changes.status {
                    if status != ConfirmStatus::Cancelled {
                        return Err(CoordError::Validation(format!(
                            "status '{}' cannot be set by update; use the decision operations",
                            status
                        )));
                    }
                    request.transition_to(status, user_id)?;
                }
                request.append_trail(user_id, actions::UPDATE, None);
                Ok(())
            })
            .await?;

        self.audit(&request, user_id, actions::UPDATE, RiskLevel::Low, details)
            .await?;
        Ok(request)
    }

    /// Remove a request; returns false if it was already gone
    pub async fn delete(&self, confirm_id: Uuid, user_id: &str) -> Result<bool> {
        self.authorize(user_id, confirm_id, "confirm:delete").await?;
        let lock = self.lock_for(confirm_id).await;
        let _guard = lock.lock().await;

        let request = self.get(confirm_id).await?;
        let deleted = self.confirms.delete(&confirm_id.to_string()).await?;
        if deleted {
            self.audit(
                &request,
                user_id,
                actions::DELETE,
                RiskLevel::Medium,
                json!({ "status": request.status.as_str() }),
            )
            .await?;
            info!(%confirm_id, "Confirm request deleted");
        }
        self.changed.notify_waiters();
        Ok(deleted)
    }

    pub async fn get(&self, confirm_id: Uuid) -> Result<ConfirmRequest> {
        self.confirms
            .find_by_id(&confirm_id.to_string())
            .await?
            .ok_or_else(|| CoordError::not_found("ConfirmRequest", confirm_id))
    }

    pub async fn list(&self, pagination: Pagination) -> Result<Page<ConfirmRequest>> {
        self.confirms.query(&Filter::new(), pagination).await
    }

    pub async fn query(&self, filter: &Filter, pagination: Pagination) -> Result<Page<ConfirmRequest>> {
        self.confirms.query(filter, pagination).await
    }

    /// Most recent request submitted for a context
    pub async fn find_by_context(&self, context_id: &str) -> Result<Option<ConfirmRequest>> {
        let page = self
            .confirms
            .query(
                &Filter::new().eq("context_id", context_id),
                Pagination {
                    offset: 0,
                    limit: usize::MAX,
                },
            )
            .await?;
        Ok(page.items.into_iter().max_by_key(|r| r.created_at))
    }

    /// Suspend until the request reaches a terminal status
    pub async fn wait_for_resolution(
        &self,
        confirm_id: Uuid,
        timeout: Duration,
    ) -> Result<ConfirmRequest> {
        let now = tokio::time::Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + MAX_WAIT);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let request = self.get(confirm_id).await?;
            if request.status.is_terminal() {
                return Ok(request);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(CoordError::Timeout(format!(
                    "confirm request {} still {} after {}ms",
                    confirm_id,
                    request.status,
                    timeout.as_millis()
                )));
            }
        }
    }

    async fn authorize(&self, user_id: &str, confirm_id: Uuid, action: &str) -> Result<()> {
        self.auditor
            .require_permission(user_id, &PermissionTarget::Confirm(confirm_id), action)
            .await
            .map(|_| ())
    }

    /// Per-request lock; entries go away once no caller holds them
    async fn lock_for(&self, confirm_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(&confirm_id).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(Mutex::new(()));
        locks.insert(confirm_id, Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| lock.strong_count() > 0);
        locks.len()
    }

    /// Load, apply and save one request under its lock
    ///
    /// A `PermissionDenied` from the domain rules is recorded as a violation.
    async fn mutate<F>(&self, confirm_id: Uuid, user_id: &str, apply: F) -> Result<ConfirmRequest>
    where
        F: FnOnce(&mut ConfirmRequest) -> Result<()>,
    {
        let lock = self.lock_for(confirm_id).await;
        let _guard = lock.lock().await;

        let mut request = self.get(confirm_id).await?;
        let previous = request.status;
        if let Err(err) = apply(&mut request) {
            if let CoordError::PermissionDenied(reason) = &err {
                let entry = AuditEntry::new(
                    confirm_id.to_string(),
                    user_id,
                    "confirm:mutate",
                    AuditResult::Failure,
                    request.risk_level.max(RiskLevel::Medium),
                )
                .with_details(json!({ "reason": reason }));
                self.auditor.audit_log().log_security_violation(entry).await?;
            }
            return Err(err);
        }
        self.confirms.save(&request).await?;

        if request.status != previous {
            self.publish_status_change(&request, previous).await;
        }
        Ok(request)
    }

    async fn change_status(
        &self,
        confirm_id: Uuid,
        user_id: &str,
        next: ConfirmStatus,
        action: &str,
        reason: Option<String>,
    ) -> Result<ConfirmRequest> {
        let lock = self.lock_for(confirm_id).await;
        let _guard = lock.lock().await;

        let mut request = self.get(confirm_id).await?;
        let previous = request.transition_to(next, user_id)?;
        if let Some(reason) = &reason {
            request.append_trail(user_id, action, Some(reason.clone()));
        }
        self.confirms.save(&request).await?;
        self.after_status_change(&request, previous, action, reason)
            .await?;
        Ok(request)
    }

    async fn after_status_change(
        &self,
        request: &ConfirmRequest,
        previous: ConfirmStatus,
        action: &str,
        reason: Option<String>,
    ) -> Result<()> {
        let actor = request
            .audit_trail
            .last()
            .map(|e| e.user_id.clone())
            .unwrap_or_else(|| SYSTEM_ACTOR.to_string());
        let risk = if request.status == ConfirmStatus::Escalated {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };
        self.audit(
            request,
            &actor,
            action,
            risk,
            json!({ "from": previous.as_str(), "to": request.status.as_str(), "reason": reason }),
        )
        .await?;
        self.publish_status_change(request, previous).await;
        Ok(())
    }

    async fn publish_status_change(&self, request: &ConfirmRequest, previous: ConfirmStatus) {
        info!(
            confirm_id = %request.confirm_id,
            from = %previous,
            to = %request.status,
            "Confirm status changed"
        );
        self.publish(
            Event::entity(
                request.confirm_id.to_string(),
                EventType::ConfirmStatusChanged,
                format!("{} -> {}", previous, request.status),
            )
            .with_data(json!({ "from": previous.as_str(), "to": request.status.as_str() })),
        )
        .await;
        self.changed.notify_waiters();
    }

    async fn with_status(&self, status: ConfirmStatus) -> Result<Vec<ConfirmRequest>> {
        let page = self
            .confirms
            .query(
                &Filter::new().eq("status", status.as_str()),
                Pagination {
                    offset: 0,
                    limit: usize::MAX,
                },
            )
            .await?;
        Ok(page.items)
    }

    async fn audit(
        &self,
        request: &ConfirmRequest,
        user_id: &str,
        action: &str,
        risk: RiskLevel,
        details: serde_json::Value,
    ) -> Result<()> {
        let entry = AuditEntry::new(
            request.confirm_id.to_string(),
            user_id,
            action,
            AuditResult::Success,
            risk,
        )
        .with_details(details);
        self.auditor.audit_log().log_approval_action(entry).await
    }

    async fn flag_suspicious(&self, confirm_id: Uuid) -> Result<()> {
        for finding in self
            .auditor
            .detect_suspicious_activity(&confirm_id.to_string())
            .await?
        {
            warn!(
                %confirm_id,
                user_id = %finding.user_id,
                description = %finding.description,
                "Suspicious approval activity"
            );
        }
        Ok(())
    }

    async fn publish(&self, event: Event) {
        if let Err(err) = self.events.publish(event).await {
            warn!(error = %err, "Failed to publish approval event");
        }
    }
}

fn decision_action(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Approve => actions::APPROVE,
        Outcome::Reject => actions::REJECT,
    }
}
