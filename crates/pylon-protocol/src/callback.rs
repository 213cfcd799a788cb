//! Callback payloads posted by workers to the callback endpoint.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{Response, ResponseField};

/// Routing metadata attached to every callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackMeta {
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Raw callback body: `{method, ...fields, meta}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub method: String,
    pub meta: CallbackMeta,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A callback resolved against the method table.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCallback {
    pub invocation_id: String,
    pub request_id: Option<String>,
    pub field: ResponseField,
    /// Partial response holding only `field`; `is_stopped` is set for errors.
    pub response: Response,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[error("invalid callback payload: {0}")]
    InvalidPayload(String),
    #[error("callback meta.invocation_id must be non-empty")]
    MissingInvocationId,
    #[error("unknown callback method '{0}'")]
    UnknownMethod(String),
}

pub fn parse_callback_payload(raw: &[u8]) -> Result<CallbackPayload, CallbackError> {
    serde_json::from_slice(raw).map_err(|error| CallbackError::InvalidPayload(error.to_string()))
}

impl CallbackPayload {
    pub fn new(
        method: impl Into<String>,
        invocation_id: impl Into<String>,
        request_id: Option<String>,
    ) -> Self {
        Self {
            method: method.into(),
            meta: CallbackMeta {
                invocation_id: invocation_id.into(),
                request_id,
            },
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Maps the callback onto exactly one response field.
    pub fn normalize(self) -> Result<NormalizedCallback, CallbackError> {
        let invocation_id = self.meta.invocation_id.trim().to_string();
        if invocation_id.is_empty() {
            return Err(CallbackError::MissingInvocationId);
        }
        let field = ResponseField::from_method(&self.method)
            .ok_or_else(|| CallbackError::UnknownMethod(self.method.clone()))?;
        let value = callback_field_value(self.fields);
        if value.is_null() {
            return Err(CallbackError::InvalidPayload(format!(
                "callback '{}' carries a null value",
                self.method
            )));
        }
        let mut response = Response::with(field, value);
        response.is_stopped = field.is_terminal();
        Ok(NormalizedCallback {
            invocation_id,
            request_id: self.meta.request_id,
            field,
            response,
        })
    }
}

/// `content` wins, then `results`, otherwise every non-meta field as one object.
fn callback_field_value(mut fields: Map<String, Value>) -> Value {
    if let Some(content) = fields.remove("content") {
        return content;
    }
    if let Some(results) = fields.remove("results") {
        return results;
    }
    Value::Object(fields)
}
