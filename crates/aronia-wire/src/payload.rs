//! JSON payload schemas, one per frame type.
//!
//! The payload of every frame is a UTF-8 JSON object whose shape is part of
//! the frame type's contract. Event payloads are opaque application values
//! and have no schema here.

use serde::{Deserialize, Serialize};

/// Error code returned when a request names an unregistered method.
pub const ERR_METHOD_NOT_FOUND: &str = "method-not-found";

/// Error code returned when a handler fails.
pub const ERR_HANDLER_FAILED: &str = "handler-failed";

/// A peer's self-description, sent right after the session activates.
///
/// Received capabilities replace any previously known capabilities for
/// that peer. Purely informational.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Implementation name, e.g. `"aronia"`.
    pub agent: String,
    /// Implementation version.
    pub version: String,
    /// Capability tokens this peer accepts.
    pub accepts: Vec<String>,
}

/// Payload of a `CONTROL` frame: `{type: "heartbeat" | "capabilities", data?}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ControlPayload {
    /// Keepalive. Carries no data; its arrival re-arms the liveness timer.
    Heartbeat,
    /// Capability announcement.
    Capabilities(Capabilities),
}

/// Payload of a `REQUEST` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Caller-allocated id, unique within the session.
    pub id: String,
    /// Registered method name to invoke.
    pub method: String,
    /// Method arguments, an opaque JSON value.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Caller's deadline in milliseconds, informational for the callee.
    pub timeout: u64,
}

/// Payload of a `RESPONSE` frame. Exactly one of `result` / `error` is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// The id of the request being answered.
    pub id: String,
    /// Handler result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Handler failure on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// The error half of a response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ResponseError {
    /// The response for a request naming an unregistered method.
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: ERR_METHOD_NOT_FOUND.to_string(),
            message: format!("no handler registered for '{method}'"),
        }
    }

    /// The response for a handler that returned an error.
    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self {
            code: ERR_HANDLER_FAILED.to_string(),
            message: message.into(),
        }
    }
}

impl ResponsePayload {
    /// Build a success response for `id`.
    pub fn ok(id: String, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response for `id`.
    pub fn err(id: String, error: ResponseError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}
