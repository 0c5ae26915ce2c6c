//! Protocol dispatcher tests
//!
//! Drives the engine the way `stagegate dispatch` does: raw JSON request
//! lines in, response envelopes out.

use serde_json::{json, Value};

use stagegate::config::Settings;
use stagegate::protocol::{Dispatcher, ResponseStatus, PROTOCOL_VERSION};
use stagegate::Engine;

async fn send(dispatcher: &Dispatcher, request: Value) -> (ResponseStatus, Value) {
    let response = dispatcher.dispatch_json(&request.to_string()).await;
    assert_eq!(response.protocol_version, PROTOCOL_VERSION);
    let body = match &response.error {
        Some(error) => json!({ "code": error.code, "message": error.message }),
        None => response.result.clone().unwrap_or(Value::Null),
    };
    (response.status, body)
}

fn create_request(context: &str, approver: &str) -> Value {
    json!({
        "operation": "create",
        "requestId": "req-1",
        "payload": {
            "contextId": context,
            "title": "Deploy billing service",
            "requestedBy": "rita",
            "approvers": [{ "userId": approver, "role": "approver" }]
        }
    })
}

#[tokio::test]
async fn test_create_approve_get() {
    let engine = Engine::in_memory(Settings::default());
    let dispatcher = engine.dispatcher();

    let response = dispatcher
        .dispatch_json(&create_request("ctx-1", "alice").to_string())
        .await;
    assert!(response.is_success());
    assert_eq!(response.request_id.as_deref(), Some("req-1"));
    assert_eq!(response.metadata.operation, "create");

    let created = response.result.unwrap();
    assert_eq!(created["status"], "pending");
    let confirm_id = created["confirmId"].as_str().unwrap().to_string();
    let step_id = created["approvalWorkflow"]["steps"][0]["stepId"]
        .as_str()
        .unwrap()
        .to_string();

    let (status, approved) = send(
        &dispatcher,
        json!({
            "operation": "approve",
            "payload": { "confirmId": confirm_id, "stepId": step_id, "userId": "alice", "comments": "ship it" }
        }),
    )
    .await;
    assert_eq!(status, ResponseStatus::Success);
    assert_eq!(approved["status"], "approved");
    assert_eq!(
        approved["approvalWorkflow"]["steps"][0]["decision"]["decidedBy"],
        "alice"
    );

    let (status, fetched) = send(
        &dispatcher,
        json!({ "operation": "get", "payload": { "confirmId": confirm_id, "userId": "rita" } }),
    )
    .await;
    assert_eq!(status, ResponseStatus::Success);
    assert_eq!(fetched["status"], "approved");
    assert!(!fetched["auditTrail"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_operation_is_validation_error() {
    let engine = Engine::in_memory(Settings::default());
    let (status, body) = send(
        &engine.dispatcher(),
        json!({ "operation": "launch_rockets", "payload": {} }),
    )
    .await;

    assert_eq!(status, ResponseStatus::Error);
    assert_eq!(body["code"], "ValidationError");
    assert!(body["message"].as_str().unwrap().contains("launch_rockets"));
}

#[tokio::test]
async fn test_malformed_line_is_validation_error() {
    let engine = Engine::in_memory(Settings::default());
    let response = engine.dispatcher().dispatch_json("{ not json").await;

    assert!(!response.is_success());
    assert_eq!(response.error.unwrap().code, "ValidationError");
    assert_eq!(response.metadata.operation, "unknown");
}

#[tokio::test]
async fn test_missing_request_is_not_found() {
    let engine = Engine::in_memory(Settings::default());
    let (status, body) = send(
        &engine.dispatcher(),
        json!({ "operation": "get", "payload": { "confirmId": uuid::Uuid::new_v4() } }),
    )
    .await;

    assert_eq!(status, ResponseStatus::Error);
    assert_eq!(body["code"], "NotFoundError");
}

#[tokio::test]
async fn test_non_participant_cannot_read() {
    let engine = Engine::in_memory(Settings::default());
    let dispatcher = engine.dispatcher();
    let (_, created) = send(&dispatcher, create_request("ctx-2", "alice")).await;

    let (status, body) = send(
        &dispatcher,
        json!({ "operation": "get", "payload": { "confirmId": created["confirmId"], "userId": "mallory" } }),
    )
    .await;
    assert_eq!(status, ResponseStatus::Error);
    assert_eq!(body["code"], "PermissionDeniedError");
}

#[tokio::test]
async fn test_register_agent_and_assign_tasks() {
    let engine = Engine::in_memory(Settings::default());
    let dispatcher = engine.dispatcher();

    for (agent, capabilities) in [("builder", vec!["rust", "docker"]), ("writer", vec!["docs"])] {
        let (status, registered) = send(
            &dispatcher,
            json!({
                "operation": "register_agent",
                "payload": { "agentId": agent, "capabilities": capabilities, "maxConcurrentTasks": 2 }
            }),
        )
        .await;
        assert_eq!(status, ResponseStatus::Success);
        assert_eq!(registered["agentId"], agent);
    }

    let (status, result) = send(
        &dispatcher,
        json!({
            "operation": "assign_tasks",
            "payload": {
                "planId": "plan-1",
                "tasks": [
                    { "taskId": "build", "requirements": ["rust"], "priority": "high" },
                    { "taskId": "manual", "requirements": ["docs"] }
                ]
            }
        }),
    )
    .await;
    assert_eq!(status, ResponseStatus::Success);

    let assignments = result["assignments"].as_array().unwrap();
    assert_eq!(assignments.len(), 2);
    let agent_for = |task: &str| {
        assignments
            .iter()
            .find(|a| a["taskId"] == task)
            .map(|a| a["agentId"].clone())
    };
    assert_eq!(agent_for("build"), Some(json!("builder")));
    assert_eq!(agent_for("manual"), Some(json!("writer")));

    let (status, started) = send(
        &dispatcher,
        json!({ "operation": "start_task", "payload": { "taskId": "build" } }),
    )
    .await;
    assert_eq!(status, ResponseStatus::Success);
    assert_eq!(started["status"], "in_progress");
}

#[tokio::test]
async fn test_list_filters_and_paginates() {
    let engine = Engine::in_memory(Settings::default());
    let dispatcher = engine.dispatcher();
    for context in ["ctx-a", "ctx-a", "ctx-b"] {
        let (status, _) = send(&dispatcher, create_request(context, "alice")).await;
        assert_eq!(status, ResponseStatus::Success);
    }

    let (status, page) = send(
        &dispatcher,
        json!({ "operation": "list", "payload": { "filter": { "contextId": "ctx-a" }, "limit": 1 } }),
    )
    .await;
    assert_eq!(status, ResponseStatus::Success);
    assert_eq!(page["total"], 2);
    assert_eq!(page["limit"], 1);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["items"][0]["contextId"], "ctx-a");

    let (status, everything) = send(&dispatcher, json!({ "operation": "list" })).await;
    assert_eq!(status, ResponseStatus::Success);
    assert_eq!(everything["total"], 3);
}

#[tokio::test]
async fn test_out_of_range_expiry_is_validation_error() {
    let engine = Engine::in_memory(Settings::default());
    let dispatcher = engine.dispatcher();
    let mut request = create_request("ctx-far", "alice");
    request["payload"]["expiresInSecs"] = json!(10_000_000_000_000u64);

    let (status, body) = send(&dispatcher, request).await;
    assert_eq!(status, ResponseStatus::Error);
    assert_eq!(body["code"], "ValidationError");

    let (_, everything) = send(&dispatcher, json!({ "operation": "list" })).await;
    assert_eq!(everything["total"], 0);
}

#[tokio::test]
async fn test_update_status_cannot_approve() {
    let engine = Engine::in_memory(Settings::default());
    let dispatcher = engine.dispatcher();
    let (_, created) = send(&dispatcher, create_request("ctx-upd", "alice")).await;

    for target in ["in_review", "approved"] {
        let (status, body) = send(
            &dispatcher,
            json!({
                "operation": "update",
                "payload": { "confirmId": created["confirmId"], "userId": "rita", "status": target }
            }),
        )
        .await;
        assert_eq!(status, ResponseStatus::Error);
        assert_eq!(body["code"], "ValidationError");
    }

    let (_, fetched) = send(
        &dispatcher,
        json!({ "operation": "get", "payload": { "confirmId": created["confirmId"] } }),
    )
    .await;
    assert_eq!(fetched["status"], "pending");
}
