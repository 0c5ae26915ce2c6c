//! Permission checks, risk assessment, and suspicious-activity detection.
//!
//! Permission checks fail closed: a missing confirm request, a user outside
//! the request's workflow, a role without the action, or a lookup failure all
//! deny, and every denial is written to the audit log as a
//! `security_violation`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::{AuditLogger, Repository};
use crate::domain::audit::actions;
use crate::domain::{
    ActivityType, AuditEntry, AuditResult, ConfirmRequest, Outcome, RiskLevel, SuspiciousActivity,
};
use crate::error::{CoordError, Result};

/// Role-based permissions over action names (`confirm:approve`, `task:assign`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    /// Role -> glob patterns over action names
    #[serde(default = "default_role_table")]
    pub roles: BTreeMap<String, Vec<String>>,

    /// User -> roles
    #[serde(default)]
    pub users: BTreeMap<String, Vec<String>>,

    /// Roles for users not listed in `users`
    #[serde(default = "default_roles")]
    pub default_roles: Vec<String>,
}

fn default_role_table() -> BTreeMap<String, Vec<String>> {
    let table: [(&str, &[&str]); 4] = [
        ("admin", &["*"]),
        (
            "approver",
            &[
                "confirm:approve",
                "confirm:reject",
                "confirm:delegate",
                "confirm:escalate",
                "confirm:resume",
                "confirm:read",
            ],
        ),
        (
            "requester",
            &["confirm:create", "confirm:read", "confirm:cancel", "confirm:update"],
        ),
        ("coordinator", &["task:*", "resource:*", "agent:*", "plan:*"]),
    ];
    table
        .iter()
        .map(|(role, patterns)| {
            (
                role.to_string(),
                patterns.iter().map(|p| p.to_string()).collect(),
            )
        })
        .collect()
}

fn default_roles() -> Vec<String> {
    vec!["approver".to_string(), "requester".to_string()]
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            roles: default_role_table(),
            users: BTreeMap::new(),
            default_roles: default_roles(),
        }
    }
}

impl PermissionPolicy {
    pub fn roles_for(&self, user_id: &str) -> &[String] {
        self.users
            .get(user_id)
            .map(Vec::as_slice)
            .unwrap_or(&self.default_roles)
    }

    /// Grant `role` to `user_id`
    pub fn assign(mut self, user_id: impl Into<String>, role: impl Into<String>) -> Self {
        self.users.entry(user_id.into()).or_default().push(role.into());
        self
    }

    pub fn allows(&self, user_id: &str, action: &str) -> bool {
        self.roles_for(user_id).iter().any(|role| {
            self.roles.get(role).into_iter().flatten().any(|pattern| {
                Pattern::new(pattern)
                    .map(|p| p.matches(action))
                    .unwrap_or(false)
            })
        })
    }
}

/// Thresholds for suspicious-activity detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousActivityRules {
    /// Approval actions by one user within the window that count as rapid
    #[serde(default = "default_rapid_count")]
    pub rapid_decision_count: usize,

    #[serde(default = "default_rapid_window")]
    pub rapid_decision_window_secs: u64,

    /// Reassignments of one task before it is flagged
    #[serde(default = "default_reassignment_threshold")]
    pub reassignment_threshold: usize,

    /// Violations by one user on one subject before they are flagged
    #[serde(default = "default_denial_threshold")]
    pub denial_threshold: usize,
}

fn default_rapid_count() -> usize {
    5
}
fn default_rapid_window() -> u64 {
    60
}
fn default_reassignment_threshold() -> usize {
    3
}
fn default_denial_threshold() -> usize {
    3
}

impl Default for SuspiciousActivityRules {
    fn default() -> Self {
        Self {
            rapid_decision_count: default_rapid_count(),
            rapid_decision_window_secs: default_rapid_window(),
            reassignment_threshold: default_reassignment_threshold(),
            denial_threshold: default_denial_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub policy: PermissionPolicy,
    #[serde(default)]
    pub suspicious: SuspiciousActivityRules,
}

/// What a permission check is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionTarget {
    /// A confirm request; the user must take part in its workflow
    Confirm(Uuid),
    /// Anything else, named for the audit trail (`plan:p-1`, `resource:gpu`)
    Resource(String),
}

impl PermissionTarget {
    pub fn subject_id(&self) -> String {
        match self {
            Self::Confirm(id) => id.to_string(),
            Self::Resource(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub granted: bool,
    pub reason: String,
    pub audit_id: Uuid,
}

impl PermissionDecision {
    /// Turn a denial into `PermissionDenied`
    pub fn into_result(self) -> Result<Self> {
        if self.granted {
            Ok(self)
        } else {
            Err(CoordError::PermissionDenied(self.reason))
        }
    }
}

/// Risk of logging `outcome` on a request of `request_risk`
///
/// Approving a critical request is the riskiest action recorded.
pub fn assess_risk_level(outcome: Outcome, request_risk: RiskLevel) -> RiskLevel {
    match (request_risk, outcome) {
        (RiskLevel::Critical, Outcome::Approve) => RiskLevel::High,
        (RiskLevel::Critical, Outcome::Reject) => RiskLevel::Medium,
        (RiskLevel::High, Outcome::Approve) => RiskLevel::Medium,
        (RiskLevel::High, Outcome::Reject) => RiskLevel::Low,
        _ => RiskLevel::Low,
    }
}

pub struct SecurityAuditor {
    policy: PermissionPolicy,
    rules: SuspiciousActivityRules,
    confirms: Arc<dyn Repository<ConfirmRequest>>,
    audit: Arc<dyn AuditLogger>,
}

impl SecurityAuditor {
    pub fn new(
        settings: SecuritySettings,
        confirms: Arc<dyn Repository<ConfirmRequest>>,
        audit: Arc<dyn AuditLogger>,
    ) -> Self {
        Self {
            policy: settings.policy,
            rules: settings.suspicious,
            confirms,
            audit,
        }
    }

    pub fn audit_log(&self) -> &Arc<dyn AuditLogger> {
        &self.audit
    }

    pub fn policy(&self) -> &PermissionPolicy {
        &self.policy
    }

    /// Decide whether `user_id` may perform `action` on `target`
    pub async fn validate_permission(
        &self,
        user_id: &str,
        target: &PermissionTarget,
        action: &str,
    ) -> Result<PermissionDecision> {
        let subject_id = target.subject_id();

        let (denial, request_risk) = match target {
            PermissionTarget::Confirm(confirm_id) => {
                match self.confirms.find_by_id(&confirm_id.to_string()).await {
                    Ok(Some(request)) => {
                        let denial = if !request.is_participant(user_id) {
                            Some(format!(
                                "user '{}' is not part of the workflow for {}",
                                user_id, confirm_id
                            ))
                        } else {
                            None
                        };
                        (denial, Some(request.risk_level))
                    }
                    Ok(None) => (Some(format!("confirm request {} not found", confirm_id)), None),
                    Err(err) => (Some(format!("confirm lookup failed: {}", err)), None),
                }
            }
            PermissionTarget::Resource(_) => (None, None),
        };

        let denial = denial.or_else(|| {
            (!self.policy.allows(user_id, action))
                .then(|| format!("user '{}' lacks permission '{}'", user_id, action))
        });

        match denial {
            Some(reason) => {
                let risk = request_risk.unwrap_or(RiskLevel::Medium).max(RiskLevel::Medium);
                warn!(user_id, subject_id = %subject_id, action, %reason, "Permission denied");
                let entry = AuditEntry::new(&subject_id, user_id, action, AuditResult::Failure, risk)
                    .with_details(json!({ "reason": reason }));
                let audit_id = entry.audit_id;
                self.audit.log_security_violation(entry).await?;
                Ok(PermissionDecision {
                    granted: false,
                    reason,
                    audit_id,
                })
            }
            None => {
                debug!(user_id, subject_id = %subject_id, action, "Permission granted");
                let entry = AuditEntry::new(
                    &subject_id,
                    user_id,
                    actions::PERMISSION_GRANTED,
                    AuditResult::Success,
                    RiskLevel::Low,
                )
                .with_details(json!({ "action": action }));
                let audit_id = entry.audit_id;
                self.audit.log_security_event(entry).await?;
                Ok(PermissionDecision {
                    granted: true,
                    reason: "granted".to_string(),
                    audit_id,
                })
            }
        }
    }

    /// Like [`validate_permission`](Self::validate_permission) but a denial is an error
    pub async fn require_permission(
        &self,
        user_id: &str,
        target: &PermissionTarget,
        action: &str,
    ) -> Result<PermissionDecision> {
        self.validate_permission(user_id, target, action)
            .await?
            .into_result()
    }

    /// Patterns in the audit trail of one subject
    pub async fn detect_suspicious_activity(&self, subject_id: &str) -> Result<Vec<SuspiciousActivity>> {
        let trail = self.audit.get_audit_trail(subject_id).await?;
        let now = Utc::now();
        let mut findings = Vec::new();

        let mut decisions: BTreeMap<&str, Vec<&AuditEntry>> = BTreeMap::new();
        let mut outcomes: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut denials: BTreeMap<&str, usize> = BTreeMap::new();
        let mut reassignments: Vec<&AuditEntry> = Vec::new();

        for entry in &trail {
            match entry.action.as_str() {
                actions::APPROVE | actions::REJECT => {
                    decisions.entry(&entry.user_id).or_default().push(entry);
                    outcomes.entry(&entry.user_id).or_default().insert(&entry.action);
                }
                actions::DELEGATE => {
                    decisions.entry(&entry.user_id).or_default().push(entry);
                }
                actions::SECURITY_VIOLATION => {
                    *denials.entry(&entry.user_id).or_default() += 1;
                }
                actions::TASK_REASSIGNED => reassignments.push(entry),
                _ => {}
            }
        }

        let window = i64::try_from(self.rules.rapid_decision_window_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX);
        let needed = self.rules.rapid_decision_count.max(1);
        for (user, mut entries) in decisions {
            entries.sort_by_key(|e| e.timestamp);
            let burst = entries
                .windows(needed)
                .any(|w| w[needed - 1].timestamp - w[0].timestamp <= window);
            if burst {
                findings.push(SuspiciousActivity {
                    user_id: user.to_string(),
                    activity_type: ActivityType::RapidDecisions,
                    severity: RiskLevel::Medium,
                    description: format!(
                        "{} or more approval actions within {}s on {}",
                        needed, self.rules.rapid_decision_window_secs, subject_id
                    ),
                    timestamp: now,
                });
            }
        }

        for (user, seen) in outcomes {
            if seen.contains(actions::APPROVE) && seen.contains(actions::REJECT) {
                findings.push(SuspiciousActivity {
                    user_id: user.to_string(),
                    activity_type: ActivityType::DecisionReversal,
                    severity: RiskLevel::High,
                    description: format!("both approved and rejected on {}", subject_id),
                    timestamp: now,
                });
            }
        }

        if !reassignments.is_empty() && reassignments.len() >= self.rules.reassignment_threshold {
            let last_user = reassignments
                .last()
                .map(|e| e.user_id.clone())
                .unwrap_or_default();
            findings.push(SuspiciousActivity {
                user_id: last_user,
                activity_type: ActivityType::RepeatedReassignment,
                severity: RiskLevel::Medium,
                description: format!(
                    "task {} reassigned {} times",
                    subject_id,
                    reassignments.len()
                ),
                timestamp: now,
            });
        }

        for (user, count) in denials {
            if count >= self.rules.denial_threshold {
                findings.push(SuspiciousActivity {
                    user_id: user.to_string(),
                    activity_type: ActivityType::RepeatedPermissionDenials,
                    severity: RiskLevel::High,
                    description: format!("{} permission denials on {}", count, subject_id),
                    timestamp: now,
                });
            }
        }

        if !findings.is_empty() {
            warn!(subject_id, count = findings.len(), "Suspicious activity detected");
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryAuditLogger, InMemoryStore, StoreRepository};
    use crate::domain::{Approver, NewConfirm, Priority, WorkflowKind};

    async fn fixture() -> (SecurityAuditor, Arc<InMemoryAuditLogger>, ConfirmRequest) {
        let repo: Arc<dyn Repository<ConfirmRequest>> = Arc::new(
            StoreRepository::<ConfirmRequest>::new(Arc::new(InMemoryStore::new())),
        );
        let audit = Arc::new(InMemoryAuditLogger::new());
        let request = ConfirmRequest::create(NewConfirm {
            context_id: "ctx".into(),
            plan_id: None,
            title: "deploy".into(),
            description: None,
            priority: Priority::High,
            risk_level: RiskLevel::Critical,
            requested_by: "req".into(),
            kind: WorkflowKind::Parallel,
            approvers: vec![Approver::required("alice", "lead")],
            escalation: None,
            expires_in_secs: None,
        })
        .unwrap();
        repo.save(&request).await.unwrap();
        let auditor = SecurityAuditor::new(SecuritySettings::default(), repo, audit.clone());
        (auditor, audit, request)
    }

    #[test]
    fn test_risk_table() {
        assert_eq!(assess_risk_level(Outcome::Approve, RiskLevel::Critical), RiskLevel::High);
        assert_eq!(assess_risk_level(Outcome::Reject, RiskLevel::Critical), RiskLevel::Medium);
        assert_eq!(assess_risk_level(Outcome::Approve, RiskLevel::High), RiskLevel::Medium);
        assert_eq!(assess_risk_level(Outcome::Reject, RiskLevel::High), RiskLevel::Low);
        assert_eq!(assess_risk_level(Outcome::Approve, RiskLevel::Low), RiskLevel::Low);
    }

    #[test]
    fn test_policy_globs() {
        let policy = PermissionPolicy::default().assign("ops", "coordinator");
        assert!(policy.allows("ops", "task:assign"));
        assert!(!policy.allows("ops", "confirm:approve"));
        assert!(policy.allows("anyone", "confirm:approve"));
        assert!(!policy.allows("anyone", "confirm:delete"));
    }

    #[tokio::test]
    async fn test_outsider_denied_and_audited() {
        let (auditor, audit, request) = fixture().await;
        let target = PermissionTarget::Confirm(request.confirm_id);

        let decision = auditor
            .validate_permission("mallory", &target, "confirm:approve")
            .await
            .unwrap();
        assert!(!decision.granted);

        let entries = audit.all().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, actions::SECURITY_VIOLATION);
        assert_eq!(entries[0].risk_level, RiskLevel::Critical);
        assert_eq!(entries[0].audit_id, decision.audit_id);
    }

    #[tokio::test]
    async fn test_missing_confirm_fails_closed() {
        let (auditor, _, _) = fixture().await;
        let err = auditor
            .require_permission("alice", &PermissionTarget::Confirm(Uuid::new_v4()), "confirm:read")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_participant_granted() {
        let (auditor, _, request) = fixture().await;
        let decision = auditor
            .validate_permission("alice", &PermissionTarget::Confirm(request.confirm_id), "confirm:approve")
            .await
            .unwrap();
        assert!(decision.granted);
    }

    #[tokio::test]
    async fn test_detects_reversal_and_denials() {
        let (auditor, audit, _) = fixture().await;
        for action in [actions::APPROVE, actions::REJECT] {
            audit
                .append(AuditEntry::new("c-9", "bob", action, AuditResult::Success, RiskLevel::Low))
                .await
                .unwrap();
        }
        for _ in 0..3 {
            auditor
                .validate_permission("eve", &PermissionTarget::Resource("c-9".into()), "confirm:delete")
                .await
                .unwrap();
        }

        let findings = auditor.detect_suspicious_activity("c-9").await.unwrap();
        let kinds: Vec<ActivityType> = findings.iter().map(|f| f.activity_type).collect();
        assert!(kinds.contains(&ActivityType::DecisionReversal));
        assert!(kinds.contains(&ActivityType::RepeatedPermissionDenials));
    }
}
