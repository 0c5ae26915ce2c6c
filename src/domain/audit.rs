//! Audit records and suspicious-activity findings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub audit_id: Uuid,
    /// Confirm id, task id, or resource the action touched
    pub subject_id: String,
    pub user_id: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub result: AuditResult,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        subject_id: impl Into<String>,
        user_id: impl Into<String>,
        action: impl Into<String>,
        result: AuditResult,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            user_id: user_id.into(),
            action: action.into(),
            timestamp: Utc::now(),
            result,
            risk_level,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
    Warning,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known audit action names
pub mod actions {
    pub const SECURITY_VIOLATION: &str = "security_violation";
    pub const PERMISSION_GRANTED: &str = "permission_granted";
    pub const APPROVE: &str = "approve";
    pub const REJECT: &str = "reject";
    pub const DELEGATE: &str = "delegate";
    pub const ESCALATE: &str = "escalate";
    pub const RESUME: &str = "resume";
    pub const CANCEL: &str = "cancel";
    pub const EXPIRE: &str = "expire";
    pub const SUBMIT: &str = "submit";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const TASK_REASSIGNED: &str = "task_reassigned";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    RapidDecisions,
    DecisionReversal,
    RepeatedReassignment,
    RepeatedPermissionDenials,
}

/// Pattern in the audit trail that warrants a closer look
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousActivity {
    pub user_id: String,
    pub activity_type: ActivityType,
    pub severity: RiskLevel,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}
