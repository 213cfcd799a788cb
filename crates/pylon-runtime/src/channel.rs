//! Per-invocation delivery channel.
//!
//! A channel binds one invocation id to the host delivery function. Any number
//! of non-terminal responses may flow through it, followed by exactly one
//! terminal response (`is_stopped = true`). Host terminate requests, worker exit
//! handlers, and the on-demand watchdog may all race to end the invocation;
//! the first one wins and the rest observe the terminated state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pylon_protocol::{ExtensionKind, Response};
use tracing::debug;

use crate::{lock_or_recover, InvocationError};

/// Host-side delivery function for outbound responses.
pub type DeliverFn = Arc<dyn Fn(Response) + Send + Sync>;

/// Called once with the invocation id when the channel completes.
pub type CompletionFn = Box<dyn FnOnce(&str) + Send>;

pub struct InvocationChannel {
    invocation_id: String,
    extension_kind: ExtensionKind,
    terminated: AtomicBool,
    /// Guards delivery so nothing can be sent after the terminal response.
    terminal_delivered: Mutex<bool>,
    deliver: DeliverFn,
    on_complete: Mutex<Option<CompletionFn>>,
}

impl fmt::Debug for InvocationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationChannel")
            .field("invocation_id", &self.invocation_id)
            .field("extension_kind", &self.extension_kind)
            .field("is_terminated", &self.is_terminated())
            .finish()
    }
}

impl InvocationChannel {
    pub fn new(
        invocation_id: impl Into<String>,
        extension_kind: ExtensionKind,
        deliver: DeliverFn,
        on_complete: CompletionFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            invocation_id: invocation_id.into(),
            extension_kind,
            terminated: AtomicBool::new(false),
            terminal_delivered: Mutex::new(false),
            deliver,
            on_complete: Mutex::new(Some(on_complete)),
        })
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn extension_kind(&self) -> ExtensionKind {
        self.extension_kind
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Delivers a partial response tagged with this channel's identity.
    /// Responses with `is_stopped` set are treated as terminal. Returns false
    /// when the response was dropped because the invocation already ended.
    pub fn deliver(&self, partial: Response, request_id: Option<&str>) -> bool {
        if partial.is_stopped {
            return self.finish(partial, request_id);
        }
        let terminal_delivered = lock_or_recover(&self.terminal_delivered);
        if *terminal_delivered {
            debug!(
                invocation_id = %self.invocation_id,
                "dropping response delivered after terminal response"
            );
            return false;
        }
        (self.deliver)(self.envelope(partial, request_id));
        true
    }

    /// Delivers `partial` as the terminal response, then terminates. Returns
    /// false if another terminal response got there first.
    pub fn finish(&self, mut partial: Response, request_id: Option<&str>) -> bool {
        partial.is_stopped = true;
        let delivered = {
            let mut terminal_delivered = lock_or_recover(&self.terminal_delivered);
            if *terminal_delivered {
                false
            } else {
                *terminal_delivered = true;
                (self.deliver)(self.envelope(partial, request_id));
                true
            }
        };
        self.mark_terminated();
        delivered
    }

    /// Delivers `error` as the terminal response.
    pub fn fail(&self, error: &InvocationError) -> bool {
        self.finish(error.to_response(), None)
    }

    /// Ends the invocation with a bare stop response unless a terminal
    /// response was already delivered. Idempotent; returns true only for the
    /// call that flipped the channel to terminated.
    pub fn terminate(&self) -> bool {
        {
            let mut terminal_delivered = lock_or_recover(&self.terminal_delivered);
            if !*terminal_delivered {
                *terminal_delivered = true;
                let stop = Response {
                    is_stopped: true,
                    ..Response::default()
                };
                (self.deliver)(self.envelope(stop, None));
            }
        }
        self.mark_terminated()
    }

    fn mark_terminated(&self) -> bool {
        let won = !self.terminated.swap(true, Ordering::SeqCst);
        let on_complete = lock_or_recover(&self.on_complete).take();
        if let Some(on_complete) = on_complete {
            debug!(invocation_id = %self.invocation_id, "invocation channel completed");
            on_complete(&self.invocation_id);
        }
        won
    }

    fn envelope(&self, mut response: Response, request_id: Option<&str>) -> Response {
        response.invocation_id = self.invocation_id.clone();
        if let Some(request_id) = request_id {
            response.request_id = Some(request_id.to_string());
        }
        response
    }
}
