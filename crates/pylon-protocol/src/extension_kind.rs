use std::fmt;

use serde::{Deserialize, Serialize};

/// Enumerates the extension kinds a host can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionKind {
    Chat,
    Apply,
    SymbolLookup,
    Autocomplete,
    Tool,
    /// Control kind: tears down the invocation named by the request.
    Terminate,
}

impl ExtensionKind {
    /// Kinds backed by a worker process; excludes `Terminate`.
    pub const RUNNABLE: [ExtensionKind; 5] = [
        Self::Chat,
        Self::Apply,
        Self::SymbolLookup,
        Self::Autocomplete,
        Self::Tool,
    ];

    /// Returns the stable kebab-case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Apply => "apply",
            Self::SymbolLookup => "symbol-lookup",
            Self::Autocomplete => "autocomplete",
            Self::Tool => "tool",
            Self::Terminate => "terminate",
        }
    }

    /// Parses a kind token. Accepts both `symbol-lookup` and `symbol_lookup`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "chat" => Some(Self::Chat),
            "apply" => Some(Self::Apply),
            "symbol-lookup" => Some(Self::SymbolLookup),
            "autocomplete" => Some(Self::Autocomplete),
            "tool" => Some(Self::Tool),
            "terminate" => Some(Self::Terminate),
            _ => None,
        }
    }

    pub fn is_terminate(self) -> bool {
        matches!(self, Self::Terminate)
    }
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
