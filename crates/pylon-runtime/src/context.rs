//! Process-wide runtime context shared by the router, supervisors, and the
//! callback endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::{RunnerScriptBuilder, RuntimeConfig};

/// Built once at startup and injected wherever runtime state is needed.
#[derive(Debug)]
pub struct RuntimeContext {
    config: ArcSwap<RuntimeConfig>,
    callback_addr: Option<SocketAddr>,
}

impl RuntimeContext {
    /// `callback_addr` is the bound callback endpoint; persistent workers are
    /// pointed at it through `HOST`/`PORT`.
    pub fn new(config: RuntimeConfig, callback_addr: Option<SocketAddr>) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            callback_addr,
        }
    }

    /// Snapshot of the live configuration.
    pub fn config(&self) -> Arc<RuntimeConfig> {
        self.config.load_full()
    }

    /// Swaps in a reloaded configuration. Running workers keep the settings
    /// they were spawned with.
    pub fn replace_config(&self, config: RuntimeConfig) {
        info!(
            extensions_dir = %config.extensions_dir.display(),
            request_ceiling = config.request_ceiling,
            "runtime configuration replaced"
        );
        self.config.store(Arc::new(config));
    }

    pub fn callback_addr(&self) -> Option<SocketAddr> {
        self.callback_addr
    }

    pub fn script_builder(&self) -> RunnerScriptBuilder {
        let config = self.config();
        RunnerScriptBuilder::new(config.scripts_dir(), &config.module_search_path_var)
    }
}
