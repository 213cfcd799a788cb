//! Invalidation signals that mark persistent workers dirty.
//!
//! The runtime only consumes signals. Filesystem watchers and config reloaders
//! live in the host binary and publish through an [`InvalidationSource`].

use std::fmt;
use std::sync::{Arc, Mutex};

use pylon_protocol::ExtensionKind;
use serde::Serialize;

use crate::lock_or_recover;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    ExtensionsChanged,
    ConfigSaved,
}

impl InvalidationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExtensionsChanged => "extensions_changed",
            Self::ConfigSaved => "config_saved",
        }
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `kind = None` invalidates every persistent worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvalidationSignal {
    pub kind: Option<ExtensionKind>,
    pub reason: InvalidationReason,
}

impl InvalidationSignal {
    pub fn all(reason: InvalidationReason) -> Self {
        Self { kind: None, reason }
    }

    pub fn for_kind(kind: ExtensionKind, reason: InvalidationReason) -> Self {
        Self {
            kind: Some(kind),
            reason,
        }
    }

    pub fn applies_to(&self, kind: ExtensionKind) -> bool {
        match self.kind {
            Some(target) => target == kind,
            None => true,
        }
    }
}

pub type InvalidationListener = Arc<dyn Fn(InvalidationSignal) + Send + Sync>;

/// Registration point for anything that can emit invalidation signals.
pub trait InvalidationSource: Send + Sync {
    fn subscribe(&self, listener: InvalidationListener);
}

/// In-process fan-out used by the host watchers and by tests that simulate
/// file-change or config-save events.
#[derive(Clone, Default)]
pub struct InvalidationBroadcaster {
    listeners: Arc<Mutex<Vec<InvalidationListener>>>,
}

impl fmt::Debug for InvalidationBroadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationBroadcaster")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl InvalidationBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, signal: InvalidationSignal) {
        // Listeners run outside the lock so they may subscribe further.
        let listeners = lock_or_recover(&self.listeners).clone();
        for listener in listeners {
            listener(signal);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock_or_recover(&self.listeners).len()
    }
}

impl InvalidationSource for InvalidationBroadcaster {
    fn subscribe(&self, listener: InvalidationListener) {
        lock_or_recover(&self.listeners).push(listener);
    }
}
