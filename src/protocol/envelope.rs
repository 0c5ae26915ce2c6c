//! Request and response envelopes.
//!
//! The envelope shape is stable regardless of transport: a request names an
//! operation and carries an untyped payload; a response reports success or an
//! error code, echoes the request id, and records how the call went.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoordError;

pub const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub operation: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl RequestEnvelope {
    pub fn new(operation: impl Into<String>, payload: Value) -> Self {
        Self {
            operation: operation.into(),
            payload,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&CoordError> for ErrorBody {
    fn from(err: &CoordError) -> Self {
        Self {
            code: err.code().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub operation: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub protocol_version: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub metadata: ResponseMetadata,
}

impl ResponseEnvelope {
    pub fn success(request_id: Option<String>, result: Value, metadata: ResponseMetadata) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            status: ResponseStatus::Success,
            result: Some(result),
            error: None,
            timestamp: Utc::now(),
            request_id,
            metadata,
        }
    }

    pub fn failure(request_id: Option<String>, err: &CoordError, metadata: ResponseMetadata) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            status: ResponseStatus::Error,
            result: None,
            error: Some(ErrorBody::from(err)),
            timestamp: Utc::now(),
            request_id,
            metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_uses_camel_case() {
        let envelope: RequestEnvelope = serde_json::from_value(json!({
            "operation": "get",
            "payload": { "confirmId": "x" },
            "requestId": "r-1"
        }))
        .unwrap();
        assert_eq!(envelope.request_id.as_deref(), Some("r-1"));
    }

    #[test]
    fn test_failure_shape() {
        let err = CoordError::Validation("bad".into());
        let response = ResponseEnvelope::failure(
            Some("r-2".into()),
            &err,
            ResponseMetadata {
                operation: "create".into(),
                duration_ms: 3,
            },
        );
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], "ValidationError");
        assert_eq!(json["metadata"]["durationMs"], 3);
        assert!(json.get("result").is_none());
    }
}
