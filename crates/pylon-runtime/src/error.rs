use pylon_protocol::Response;
use thiserror::Error;

/// Failures surfaced to the host as terminal error responses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// Interpreter or extension module missing; no process was started.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to spawn worker '{program}': {error}")]
    Spawn { program: String, error: String },
    /// Error-stream output or an abnormal exit. Carries the worker's own text.
    #[error("{0}")]
    Runtime(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("worker process {pid} did not exit within {waited_ms}ms of being killed")]
    Timeout { pid: u32, waited_ms: u64 },
}

impl InvocationError {
    /// Stable snake_case label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Spawn { .. } => "spawn_error",
            Self::Runtime(_) => "runtime_error",
            Self::Protocol(_) => "protocol_error",
            Self::Timeout { .. } => "timeout_error",
        }
    }

    pub fn to_response(&self) -> Response {
        Response::error(self.to_string())
    }
}
