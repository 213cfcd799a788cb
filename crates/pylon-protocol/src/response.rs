//! Outbound response envelope delivered to the host transport.
//!
//! A response carries at most one value per [`ResponseField`]. Unset fields are
//! omitted from the serialized form rather than emitted as `null`, so consumers
//! can tell "not produced" apart from "produced an empty value".

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of payload slots a response can populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResponseField {
    Log,
    Progress,
    Error,
    Notification,
    ApplyPatch,
    InlineCompletion,
    Diagnostics,
    AutocompleteSuggestions,
    InspectionResults,
    ChatEvent,
    SymbolResults,
    AudioTranscription,
    ToolInterfaceState,
}

impl ResponseField {
    pub const ALL: [ResponseField; 13] = [
        Self::Log,
        Self::Progress,
        Self::Error,
        Self::Notification,
        Self::ApplyPatch,
        Self::InlineCompletion,
        Self::Diagnostics,
        Self::AutocompleteSuggestions,
        Self::InspectionResults,
        Self::ChatEvent,
        Self::SymbolResults,
        Self::AudioTranscription,
        Self::ToolInterfaceState,
    ];

    /// Returns the serialized key for this field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Progress => "progress",
            Self::Error => "error",
            Self::Notification => "notification",
            Self::ApplyPatch => "apply_patch",
            Self::InlineCompletion => "inline_completion",
            Self::Diagnostics => "diagnostics",
            Self::AutocompleteSuggestions => "autocomplete_suggestions",
            Self::InspectionResults => "inspection_results",
            Self::ChatEvent => "chat_event",
            Self::SymbolResults => "symbol_results",
            Self::AudioTranscription => "audio_transcription",
            Self::ToolInterfaceState => "tool_interface_state",
        }
    }

    /// Resolves a worker callback method name. Kebab-case spellings are
    /// accepted as aliases of the snake_case keys.
    pub fn from_method(method: &str) -> Option<Self> {
        let normalized = method.trim().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|field| field.as_str() == normalized)
    }

    /// Errors always end the invocation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error)
    }
}

/// Response envelope for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_patch: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_completion: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autocomplete_suggestions: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspection_results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_event: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_transcription: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_interface_state: Option<Value>,
    #[serde(default)]
    pub is_stopped: bool,
}

impl Response {
    /// Builds a partial response with a single populated field.
    pub fn with(field: ResponseField, value: Value) -> Self {
        let mut response = Self::default();
        response.set(field, value);
        response
    }

    /// Builds a terminal error response carrying a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        let mut response = Self::with(ResponseField::Error, Value::String(message.into()));
        response.is_stopped = true;
        response
    }

    /// A JSON `null` clears the field.
    pub fn set(&mut self, field: ResponseField, value: Value) {
        *self.slot_mut(field) = (!value.is_null()).then_some(value);
    }

    pub fn get(&self, field: ResponseField) -> Option<&Value> {
        match field {
            ResponseField::Log => self.log.as_ref(),
            ResponseField::Progress => self.progress.as_ref(),
            ResponseField::Error => self.error.as_ref(),
            ResponseField::Notification => self.notification.as_ref(),
            ResponseField::ApplyPatch => self.apply_patch.as_ref(),
            ResponseField::InlineCompletion => self.inline_completion.as_ref(),
            ResponseField::Diagnostics => self.diagnostics.as_ref(),
            ResponseField::AutocompleteSuggestions => self.autocomplete_suggestions.as_ref(),
            ResponseField::InspectionResults => self.inspection_results.as_ref(),
            ResponseField::ChatEvent => self.chat_event.as_ref(),
            ResponseField::SymbolResults => self.symbol_results.as_ref(),
            ResponseField::AudioTranscription => self.audio_transcription.as_ref(),
            ResponseField::ToolInterfaceState => self.tool_interface_state.as_ref(),
        }
    }

    /// Fields carrying a value, in declaration order.
    pub fn populated_fields(&self) -> Vec<ResponseField> {
        ResponseField::ALL
            .into_iter()
            .filter(|field| self.get(*field).is_some())
            .collect()
    }

    /// Returns the error text when the error field holds a string.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().and_then(Value::as_str)
    }

    fn slot_mut(&mut self, field: ResponseField) -> &mut Option<Value> {
        match field {
            ResponseField::Log => &mut self.log,
            ResponseField::Progress => &mut self.progress,
            ResponseField::Error => &mut self.error,
            ResponseField::Notification => &mut self.notification,
            ResponseField::ApplyPatch => &mut self.apply_patch,
            ResponseField::InlineCompletion => &mut self.inline_completion,
            ResponseField::Diagnostics => &mut self.diagnostics,
            ResponseField::AutocompleteSuggestions => &mut self.autocomplete_suggestions,
            ResponseField::InspectionResults => &mut self.inspection_results,
            ResponseField::ChatEvent => &mut self.chat_event,
            ResponseField::SymbolResults => &mut self.symbol_results,
            ResponseField::AudioTranscription => &mut self.audio_transcription,
            ResponseField::ToolInterfaceState => &mut self.tool_interface_state,
        }
    }
}
