//! Callback endpoint acknowledgement and error envelopes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use pylon_runtime::WorkerSnapshot;
use serde::Serialize;
use serde_json::json;

/// Rejection rendered as `{"error": {"code", "message"}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEndpointError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl CallbackEndpointError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_payload", message)
    }

    pub fn unknown_method(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "unknown_method", message)
    }

    pub fn channel_not_found(invocation_id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "channel_not_found",
            format!("no active invocation '{invocation_id}'"),
        )
    }
}

impl IntoResponse for CallbackEndpointError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": {
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackAck {
    pub status: &'static str,
    /// False when the channel had already delivered its terminal response.
    pub delivered: bool,
}

impl CallbackAck {
    pub fn accepted(delivered: bool) -> Self {
        Self {
            status: "accepted",
            delivered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallbackStatusReport {
    pub active_invocations: Vec<String>,
    pub workers: Vec<WorkerSnapshot>,
}
