//! Approval gate integration tests
//!
//! Sequential and parallel sign-off, concurrent decisions, delegation,
//! escalation, expiry and the audit trail left behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_test::{assert_err, assert_ok};

use stagegate::adapters::Pagination;
use stagegate::config::Settings;
use stagegate::core::{ApprovalGate, ConfirmUpdate, PermissionPolicy};
use stagegate::domain::{
    ApprovalStatus, Approver, ConfirmStatus, EscalationPolicy, EventType, NewConfirm, Outcome,
    Priority, RiskLevel, WorkflowKind,
};
use stagegate::{CoordError, Engine};

fn submission(kind: WorkflowKind, approvers: Vec<Approver>) -> NewConfirm {
    NewConfirm {
        context_id: "release-42".into(),
        plan_id: Some("plan-1".into()),
        title: "Ship 4.2".into(),
        description: Some("Production rollout".into()),
        priority: Priority::High,
        risk_level: RiskLevel::Medium,
        requested_by: "req".into(),
        kind,
        approvers,
        escalation: None,
        expires_in_secs: None,
    }
}

fn gate(engine: &Engine) -> Arc<ApprovalGate> {
    engine.gate().clone()
}

#[tokio::test]
async fn test_sequential_rejection_at_second_step() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let request = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Sequential,
            vec![
                Approver::required("alice", "lead"),
                Approver::required("bob", "security"),
            ],
        ))
        .await
    );
    let (first, second) = (request.steps()[0].step_id, request.steps()[1].step_id);

    let after_first = assert_ok!(
        gate.decide(request.confirm_id, first, "alice", Outcome::Approve, None)
            .await
    );
    assert_eq!(after_first.status, ConfirmStatus::InReview);

    let after_second = assert_ok!(
        gate.decide(
            request.confirm_id,
            second,
            "bob",
            Outcome::Reject,
            Some("missing pen test".into()),
        )
        .await
    );
    assert_eq!(after_second.status, ConfirmStatus::Rejected);
    assert!(!after_second.are_all_required_steps_completed());
    assert_eq!(after_second.steps()[1].status, ApprovalStatus::Rejected);

    let trail: Vec<&str> = after_second
        .audit_trail
        .iter()
        .map(|e| e.action.as_str())
        .collect();
    assert_eq!(trail.first(), Some(&"submit"));
    assert!(trail.contains(&"approve"));
    assert!(trail.contains(&"reject"));
}

#[tokio::test]
async fn test_sequential_steps_decided_in_order() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let request = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Sequential,
            vec![
                Approver::required("alice", "lead"),
                Approver::required("bob", "security"),
            ],
        ))
        .await
    );

    let err = assert_err!(
        gate.decide(
            request.confirm_id,
            request.steps()[1].step_id,
            "bob",
            Outcome::Approve,
            None,
        )
        .await
    );
    assert!(matches!(err, CoordError::Validation(_)));
    assert_eq!(
        gate.get(request.confirm_id).await.unwrap().status,
        ConfirmStatus::Pending
    );
}

#[tokio::test]
async fn test_concurrent_decisions_on_parallel_steps() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let request = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Parallel,
            vec![
                Approver::required("alice", "lead"),
                Approver::required("bob", "security"),
            ],
        ))
        .await
    );
    let confirm_id = request.confirm_id;

    let mut handles = Vec::new();
    for (idx, user) in ["alice", "bob"].into_iter().enumerate() {
        let gate = gate.clone();
        let step_id = request.steps()[idx].step_id;
        handles.push(tokio::spawn(async move {
            gate.decide(confirm_id, step_id, user, Outcome::Approve, None)
                .await
        }));
    }
    for handle in handles {
        assert_ok!(handle.await.unwrap());
    }

    let stored = gate.get(confirm_id).await.unwrap();
    assert_eq!(stored.status, ConfirmStatus::Approved);
    assert!(stored
        .steps()
        .iter()
        .all(|s| s.status == ApprovalStatus::Approved && s.decision.is_some()));

    // Both decisions land before the single transition to approved
    let approvals = stored
        .audit_trail
        .iter()
        .filter(|e| e.action == "approve")
        .count();
    assert_eq!(approvals, 2);
    let last = stored.audit_trail.last().unwrap();
    assert_eq!(last.action, "status_change");
    assert_eq!(last.details.as_deref(), Some("in_review -> approved"));
}

#[tokio::test]
async fn test_terminal_request_rejects_further_changes() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let request = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Parallel,
            vec![Approver::required("alice", "lead")],
        ))
        .await
    );
    let step = request.steps()[0].step_id;
    assert_ok!(
        gate.decide(request.confirm_id, step, "alice", Outcome::Approve, None)
            .await
    );

    let err = assert_err!(gate.cancel(request.confirm_id, "req", None).await);
    assert!(matches!(err, CoordError::InvalidStateTransition { .. }));

    let err = assert_err!(
        gate.decide(request.confirm_id, step, "alice", Outcome::Reject, None)
            .await
    );
    assert!(matches!(err, CoordError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_optional_rejection_keeps_request_open() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let request = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Parallel,
            vec![
                Approver::required("alice", "lead"),
                Approver::optional("olga", "observer"),
            ],
        ))
        .await
    );

    let after = assert_ok!(
        gate.decide(
            request.confirm_id,
            request.steps()[1].step_id,
            "olga",
            Outcome::Reject,
            None,
        )
        .await
    );
    assert_eq!(after.status, ConfirmStatus::InReview);

    let after = assert_ok!(
        gate.decide(
            request.confirm_id,
            request.steps()[0].step_id,
            "alice",
            Outcome::Approve,
            None,
        )
        .await
    );
    assert!(after.are_all_required_steps_completed());
    assert_eq!(after.status, ConfirmStatus::InReview);
}

#[tokio::test]
async fn test_delegated_step_decided_by_delegate() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let request = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Parallel,
            vec![Approver::required("alice", "lead").delegable()],
        ))
        .await
    );
    let step = request.steps()[0].step_id;

    let delegated = assert_ok!(
        gate.delegate(request.confirm_id, step, "alice", "carol", Some("on leave".into()))
            .await
    );
    assert_eq!(delegated.steps()[0].approver.user_id, "carol");
    assert_eq!(delegated.steps()[0].delegated_from, vec!["alice"]);

    let err = assert_err!(
        gate.decide(request.confirm_id, step, "alice", Outcome::Approve, None)
            .await
    );
    assert!(matches!(err, CoordError::PermissionDenied(_)));

    let decided = assert_ok!(
        gate.decide(request.confirm_id, step, "carol", Outcome::Approve, None)
            .await
    );
    assert_eq!(decided.status, ConfirmStatus::Approved);

    let trail = engine
        .audit_log()
        .get_audit_trail(&request.confirm_id.to_string())
        .await
        .unwrap();
    assert!(trail.iter().any(|e| e.action == "security_violation" && e.user_id == "alice"));
}

#[tokio::test]
async fn test_non_delegable_step() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let request = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Parallel,
            vec![Approver::required("alice", "lead")],
        ))
        .await
    );

    let err = assert_err!(
        gate.delegate(
            request.confirm_id,
            request.steps()[0].step_id,
            "alice",
            "carol",
            None,
        )
        .await
    );
    assert!(matches!(err, CoordError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_escalation_resume_and_resolution() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let mut input = submission(
        WorkflowKind::Parallel,
        vec![
            Approver::required("alice", "lead"),
            Approver::required("bob", "security"),
        ],
    );
    input.escalation = Some(EscalationPolicy {
        timeout_secs: 3600,
        escalate_to: vec!["boss".into()],
    });
    let request = assert_ok!(gate.submit(input).await);
    let id = request.confirm_id;

    // Escalation only applies once review has started
    let err = assert_err!(gate.escalate(id, "alice", None).await);
    assert!(matches!(err, CoordError::InvalidStateTransition { .. }));

    assert_ok!(
        gate.decide(id, request.steps()[0].step_id, "alice", Outcome::Approve, None)
            .await
    );
    let escalated = assert_ok!(gate.escalate(id, "bob", Some("blocked".into())).await);
    assert_eq!(escalated.status, ConfirmStatus::Escalated);

    let resumed = assert_ok!(gate.resume(id, "bob").await);
    assert_eq!(resumed.status, ConfirmStatus::InReview);

    assert_ok!(gate.escalate(id, "bob", None).await);
    let err = assert_err!(gate.resolve_escalation(id, "alice", Outcome::Approve, None).await);
    assert!(matches!(err, CoordError::PermissionDenied(_)));

    let resolved = assert_ok!(
        gate.resolve_escalation(id, "boss", Outcome::Approve, Some("ship it".into()))
            .await
    );
    assert_eq!(resolved.status, ConfirmStatus::Approved);

    let changes: Vec<String> = engine
        .events()
        .events_for(&id.to_string())
        .await
        .into_iter()
        .filter(|e| e.event_type == EventType::ConfirmStatusChanged)
        .map(|e| e.payload_summary)
        .collect();
    assert_eq!(
        changes,
        vec![
            "pending -> in_review",
            "in_review -> escalated",
            "escalated -> in_review",
            "in_review -> escalated",
            "escalated -> approved",
        ]
    );
}

#[tokio::test]
async fn test_sweeps_expire_and_escalate() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);

    let mut expiring = submission(WorkflowKind::Parallel, vec![Approver::required("alice", "lead")]);
    expiring.context_id = "expiring".into();
    expiring.expires_in_secs = Some(60);
    let expiring = assert_ok!(gate.submit(expiring).await);

    let mut stalling = submission(
        WorkflowKind::Parallel,
        vec![
            Approver::required("alice", "lead"),
            Approver::required("bob", "security"),
        ],
    );
    stalling.context_id = "stalling".into();
    let stalling = assert_ok!(gate.submit(stalling).await);
    assert_ok!(
        gate.decide(
            stalling.confirm_id,
            stalling.steps()[0].step_id,
            "alice",
            Outcome::Approve,
            None,
        )
        .await
    );

    // Nothing is due yet
    let (expired, escalated) = assert_ok!(engine.sweep(Utc::now()).await);
    assert_eq!((expired, escalated), (0, 0));

    let later = Utc::now() + ChronoDuration::days(2);
    let (expired, escalated) = assert_ok!(engine.sweep(later).await);
    assert_eq!((expired, escalated), (1, 1));

    assert_eq!(
        gate.get(expiring.confirm_id).await.unwrap().status,
        ConfirmStatus::Expired
    );
    assert_eq!(
        gate.get(stalling.confirm_id).await.unwrap().status,
        ConfirmStatus::Escalated
    );
}

#[tokio::test]
async fn test_wait_for_resolution_wakes_on_decision() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let request = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Parallel,
            vec![Approver::required("alice", "lead")],
        ))
        .await
    );
    let id = request.confirm_id;
    let step = request.steps()[0].step_id;

    let waiter = {
        let gate = gate.clone();
        tokio::spawn(async move { gate.wait_for_resolution(id, Duration::from_secs(5)).await })
    };
    tokio::task::yield_now().await;
    assert_ok!(gate.decide(id, step, "alice", Outcome::Approve, None).await);

    let resolved = assert_ok!(waiter.await.unwrap());
    assert_eq!(resolved.status, ConfirmStatus::Approved);
}

#[tokio::test]
async fn test_update_cannot_skip_sign_off() {
    let engine = Engine::in_memory(Settings::default());
    let gate = gate(&engine);
    let request = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Parallel,
            vec![
                Approver::required("alice", "lead"),
                Approver::required("bob", "security"),
            ],
        ))
        .await
    );

    for status in [
        ConfirmStatus::InReview,
        ConfirmStatus::Approved,
        ConfirmStatus::Rejected,
        ConfirmStatus::Escalated,
    ] {
        let changes = ConfirmUpdate {
            status: Some(status),
            ..Default::default()
        };
        let err = assert_err!(gate.update(request.confirm_id, "req", changes).await);
        assert!(matches!(err, CoordError::Validation(_)), "{:?}", status);
    }

    let current = assert_ok!(gate.get(request.confirm_id).await);
    assert_eq!(current.status, ConfirmStatus::Pending);
    assert!(current
        .steps()
        .iter()
        .all(|s| s.status == ApprovalStatus::Pending));
}

#[tokio::test]
async fn test_out_of_range_expiry_rejected() {
    let engine = Engine::in_memory(Settings::default());
    let mut input = submission(WorkflowKind::Parallel, vec![Approver::required("alice", "lead")]);
    input.expires_in_secs = Some(u64::MAX);

    let err = assert_err!(gate(&engine).submit(input).await);
    assert!(matches!(err, CoordError::Validation(_)));
}

#[tokio::test]
async fn test_update_query_and_delete() {
    let mut settings = Settings::default();
    settings.security.policy = PermissionPolicy::default().assign("root", "admin");
    let engine = Engine::in_memory(settings);
    let gate = gate(&engine);

    let mut input = submission(WorkflowKind::Parallel, vec![Approver::required("alice", "lead")]);
    input.requested_by = "root".into();
    let request = assert_ok!(gate.submit(input).await);
    let other = assert_ok!(
        gate.submit(submission(
            WorkflowKind::Parallel,
            vec![Approver::required("bob", "lead")],
        ))
        .await
    );

    let updated = assert_ok!(
        gate.update(
            request.confirm_id,
            "root",
            ConfirmUpdate {
                title: Some("Ship 4.2.1".into()),
                priority: Some(Priority::Critical),
                ..Default::default()
            },
        )
        .await
    );
    assert_eq!(updated.title, "Ship 4.2.1");
    assert_eq!(updated.priority, Priority::Critical);
    assert_eq!(updated.audit_trail.last().map(|e| e.action.as_str()), Some("update"));

    let page = assert_ok!(gate.list(Pagination::default()).await);
    assert_eq!(page.total, 2);

    let latest = assert_ok!(gate.find_by_context("release-42").await).unwrap();
    assert_eq!(latest.confirm_id, other.confirm_id);

    // Deleting needs the admin role
    let err = assert_err!(gate.delete(other.confirm_id, "req").await);
    assert!(matches!(err, CoordError::PermissionDenied(_)));
    assert!(assert_ok!(gate.delete(request.confirm_id, "root").await));

    let err = assert_err!(gate.get(request.confirm_id).await);
    assert!(matches!(err, CoordError::NotFound { .. }));
}
