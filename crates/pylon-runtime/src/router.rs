//! Routes host requests to invocation channels and extension handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pylon_protocol::{ExtensionKind, InvocationRequest};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    lock_or_recover, DeliverFn, ExtensionHandler, InvocationChannel, InvocationError,
    OnDemandSupervisor, PersistentSupervisor, RuntimeContext, WorkerLifecycle,
};

type ChannelRegistry = Arc<Mutex<HashMap<String, Arc<InvocationChannel>>>>;

/// Owns the `invocation_id -> channel` registry and the shared persistent
/// supervisor. Autocomplete always runs on the shared persistent handler.
pub struct DispatchRouter {
    context: Arc<RuntimeContext>,
    channels: ChannelRegistry,
    sink: DeliverFn,
    persistent: Arc<PersistentSupervisor>,
    autocomplete: ExtensionHandler,
}

impl std::fmt::Debug for DispatchRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRouter")
            .field("active_invocations", &self.active_invocations())
            .finish()
    }
}

impl DispatchRouter {
    /// `sink` receives every outbound response for the host transport.
    pub fn new(context: Arc<RuntimeContext>, sink: DeliverFn) -> Self {
        let persistent = Arc::new(PersistentSupervisor::new(Arc::clone(&context)));
        Self {
            autocomplete: ExtensionHandler::Persistent(Arc::clone(&persistent)),
            context,
            channels: Arc::new(Mutex::new(HashMap::new())),
            sink,
            persistent,
        }
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    pub fn persistent(&self) -> &Arc<PersistentSupervisor> {
        &self.persistent
    }

    /// Handles one host request. Terminate requests resolve synchronously;
    /// everything else executes on a spawned task whose handle is returned.
    pub fn on_receive(&self, request: InvocationRequest) -> Option<JoinHandle<()>> {
        let invocation_id = request.invocation_id.trim().to_string();
        if invocation_id.is_empty() {
            warn!(kind = %request.extension_kind, "dropping request without invocation_id");
            return None;
        }

        if request.extension_kind.is_terminate() {
            match self.get_channel(&invocation_id) {
                Some(channel) => {
                    info!(%invocation_id, "terminating invocation");
                    channel.terminate();
                }
                None => debug!(%invocation_id, "terminate for unknown invocation ignored"),
            }
            return None;
        }

        let kind = request.extension_kind;
        let channel = self.open_channel(&invocation_id, kind);
        let handler = match self.handler_for(kind) {
            Ok(handler) => handler,
            Err(error) => {
                warn!(%invocation_id, %kind, error = %error, "no handler for invocation");
                channel.fail(&error);
                return None;
            }
        };
        debug!(
            %invocation_id,
            %kind,
            lifecycle = handler.lifecycle().as_str(),
            "dispatching invocation"
        );
        Some(tokio::spawn(async move {
            handler.execute(channel, request).await;
        }))
    }

    pub fn get_channel(&self, invocation_id: &str) -> Option<Arc<InvocationChannel>> {
        lock_or_recover(&self.channels).get(invocation_id).cloned()
    }

    /// Registered invocation ids, sorted.
    pub fn active_invocations(&self) -> Vec<String> {
        let mut ids = lock_or_recover(&self.channels)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Terminates every open channel and retires the persistent workers.
    pub async fn shutdown(&self) {
        let channels = lock_or_recover(&self.channels)
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for channel in &channels {
            channel.terminate();
        }
        let retired = self.persistent.shutdown().await;
        info!(
            terminated = channels.len(),
            retired, "dispatch router shut down"
        );
    }

    /// Reuses the registered channel for `invocation_id` unless it already
    /// terminated, in which case a fresh one replaces it.
    fn open_channel(&self, invocation_id: &str, kind: ExtensionKind) -> Arc<InvocationChannel> {
        let mut channels = lock_or_recover(&self.channels);
        if let Some(existing) = channels.get(invocation_id) {
            if !existing.is_terminated() {
                return Arc::clone(existing);
            }
        }

        let registry = Arc::downgrade(&self.channels);
        let channel = InvocationChannel::new(
            invocation_id,
            kind,
            Arc::clone(&self.sink),
            Box::new(move |completed_id: &str| {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let mut channels = lock_or_recover(&registry);
                // A replacement channel may already own this id.
                if channels
                    .get(completed_id)
                    .is_some_and(|registered| registered.is_terminated())
                {
                    channels.remove(completed_id);
                }
            }),
        );
        channels.insert(invocation_id.to_string(), Arc::clone(&channel));
        channel
    }

    fn handler_for(&self, kind: ExtensionKind) -> Result<ExtensionHandler, InvocationError> {
        if kind == ExtensionKind::Autocomplete {
            return Ok(self.autocomplete.clone());
        }
        let config = self.context.config();
        let extension = config.extension(kind).ok_or_else(|| {
            InvocationError::Configuration(format!("no extension configured for '{kind}'"))
        })?;
        Ok(match extension.lifecycle {
            WorkerLifecycle::OnDemand => {
                ExtensionHandler::OnDemand(OnDemandSupervisor::new(Arc::clone(&self.context)))
            }
            WorkerLifecycle::Persistent => {
                ExtensionHandler::Persistent(Arc::clone(&self.persistent))
            }
        })
    }
}
