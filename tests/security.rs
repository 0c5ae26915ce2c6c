//! Security auditor integration tests
//!
//! Permission checks made by the approval gate and the coordinator, and the
//! suspicious activity patterns read back from the audit trail.

use stagegate::config::Settings;
use stagegate::core::{PermissionPolicy, PermissionTarget, SecuritySettings};
use stagegate::domain::audit::actions;
use stagegate::domain::{
    ActivityType, AgentInfo, Approver, AuditEntry, AuditResult, NewConfirm, Outcome, Priority,
    RiskLevel, TaskSpec, WorkflowKind,
};
use stagegate::{CoordError, Engine};

fn critical_request(approvers: Vec<Approver>) -> NewConfirm {
    NewConfirm {
        context_id: "db-migration".into(),
        plan_id: None,
        title: "Drop legacy tables".into(),
        description: None,
        priority: Priority::Critical,
        risk_level: RiskLevel::Critical,
        requested_by: "req".into(),
        kind: WorkflowKind::Parallel,
        approvers,
        escalation: None,
        expires_in_secs: None,
    }
}

#[tokio::test]
async fn test_decisions_leave_grant_and_approval_entries() {
    let engine = Engine::in_memory(Settings::default());
    let request = engine
        .gate()
        .submit(critical_request(vec![Approver::required("alice", "dba")]))
        .await
        .unwrap();
    let step = request.steps()[0].step_id;

    engine
        .gate()
        .decide(request.confirm_id, step, "alice", Outcome::Approve, None)
        .await
        .unwrap();

    let trail = engine
        .audit_log()
        .get_audit_trail(&request.confirm_id.to_string())
        .await
        .unwrap();
    let granted = trail
        .iter()
        .find(|e| e.action == actions::PERMISSION_GRANTED && e.user_id == "alice")
        .expect("grant recorded");
    assert_eq!(granted.result, AuditResult::Success);

    let approval = trail
        .iter()
        .find(|e| e.action == actions::APPROVE)
        .expect("approval recorded");
    // Approving a critical request is logged as high risk
    assert_eq!(approval.risk_level, RiskLevel::High);
}

#[tokio::test]
async fn test_repeated_denials_are_flagged() {
    let engine = Engine::in_memory(Settings::default());
    let request = engine
        .gate()
        .submit(critical_request(vec![Approver::required("alice", "dba")]))
        .await
        .unwrap();
    let step = request.steps()[0].step_id;

    for _ in 0..3 {
        let err = engine
            .gate()
            .decide(request.confirm_id, step, "mallory", Outcome::Approve, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::PermissionDenied(_)));
    }

    let subject = request.confirm_id.to_string();
    let violations = engine
        .audit_log()
        .get_audit_trail(&subject)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == actions::SECURITY_VIOLATION && e.user_id == "mallory")
        .count();
    assert!(violations >= 3);

    let findings = engine.auditor().detect_suspicious_activity(&subject).await.unwrap();
    let denial = findings
        .iter()
        .find(|f| f.activity_type == ActivityType::RepeatedPermissionDenials)
        .expect("denials flagged");
    assert_eq!(denial.user_id, "mallory");
    assert_eq!(denial.severity, RiskLevel::High);
}

#[tokio::test]
async fn test_rapid_decisions_are_flagged() {
    let engine = Engine::in_memory(Settings::default());
    for _ in 0..5 {
        engine
            .audit_log()
            .append(AuditEntry::new("c-rapid", "bob", actions::APPROVE, AuditResult::Success, RiskLevel::Low))
            .await
            .unwrap();
    }

    let findings = engine.auditor().detect_suspicious_activity("c-rapid").await.unwrap();
    assert!(findings
        .iter()
        .any(|f| f.activity_type == ActivityType::RapidDecisions && f.user_id == "bob"));
    assert!(!findings
        .iter()
        .any(|f| f.activity_type == ActivityType::DecisionReversal));
}

#[tokio::test]
async fn test_repeated_reassignment_is_flagged() {
    let engine = Engine::in_memory(Settings::default());
    let coordinator = engine.coordinator();
    for agent in ["a1", "a2", "a3", "a4"] {
        coordinator
            .register_agent(AgentInfo::new(agent, ["gpu"], 1))
            .await
            .unwrap();
    }
    let result = coordinator
        .assign_tasks("plan-r", vec![TaskSpec::new("train").requiring(["gpu"])], None)
        .await
        .unwrap();
    let mut holder = result.assignments[0].agent_id.clone();

    for _ in 0..3 {
        let outcome = coordinator.unregister_agent(&holder).await.unwrap();
        assert_eq!(outcome.reassigned.len(), 1);
        holder = outcome.reassigned[0].agent_id.clone();
    }

    let findings = engine.auditor().detect_suspicious_activity("train").await.unwrap();
    assert!(findings
        .iter()
        .any(|f| f.activity_type == ActivityType::RepeatedReassignment));
}

#[tokio::test]
async fn test_custom_policy_limits_coordination() {
    let mut settings = Settings::default();
    settings.security = SecuritySettings {
        policy: PermissionPolicy::default().assign("ops", "coordinator"),
        ..SecuritySettings::default()
    };
    let engine = Engine::in_memory(settings);
    let auditor = engine.auditor();

    let plan = PermissionTarget::Resource("plan:p-1".into());
    assert!(auditor.validate_permission("ops", &plan, "task:assign").await.unwrap().granted);
    assert!(!auditor.validate_permission("ops", &plan, "confirm:approve").await.unwrap().granted);
    assert!(!auditor.validate_permission("guest", &plan, "task:assign").await.unwrap().granted);

    let err = auditor
        .require_permission("guest", &plan, "task:assign")
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "PermissionDeniedError");
}
