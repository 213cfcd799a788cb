//! Inbound invocation requests received from the host transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ExtensionKind;

/// One request from the host. Everything beyond the identity fields is kept as
/// opaque context and forwarded to the worker untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub invocation_id: String,
    pub extension_kind: ExtensionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub context: Map<String, Value>,
}

impl InvocationRequest {
    pub fn new(invocation_id: impl Into<String>, extension_kind: ExtensionKind) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            extension_kind,
            request_id: None,
            context: Map::new(),
        }
    }

    /// Builds the control request that tears down `invocation_id`.
    pub fn terminate(invocation_id: impl Into<String>) -> Self {
        Self::new(invocation_id, ExtensionKind::Terminate)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Serializes the request as a single newline-terminated JSON line, the
    /// framing workers read from standard input.
    pub fn to_stdin_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Best-effort extraction of `invocation_id` from a line that failed to
    /// parse as a full request.
    pub fn recover_invocation_id(raw: &str) -> Option<String> {
        let value = serde_json::from_str::<Value>(raw).ok()?;
        value
            .get("invocation_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }
}
