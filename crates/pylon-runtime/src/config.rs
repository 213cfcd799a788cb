//! Runtime configuration loaded from TOML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pylon_protocol::ExtensionKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_REQUEST_CEILING: usize = 250;
pub const DEFAULT_WATCHDOG_POLL_MS: u64 = 100;
pub const DEFAULT_KILL_GRACE_MS: u64 = 2_000;
pub const DEFAULT_CALLBACK_HOST: &str = "127.0.0.1";
pub const DEFAULT_MODULE_SEARCH_PATH_VAR: &str = "PYTHONPATH";
pub const DEFAULT_EXTENSIONS_DIR: &str = "extensions";

/// Worker lifecycle model for an extension kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLifecycle {
    /// One process per invocation.
    #[default]
    OnDemand,
    /// One long-lived process per extension kind.
    Persistent,
}

impl WorkerLifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnDemand => "on_demand",
            Self::Persistent => "persistent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionConfig {
    /// Module (package directory or `<module>.py`) under `extensions_dir`.
    pub module: String,
    #[serde(default)]
    pub lifecycle: WorkerLifecycle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter used to run generated adapter scripts.
    pub interpreter: Option<PathBuf>,
    pub extensions_dir: PathBuf,
    /// Directory for generated adapter scripts; the system temp dir when unset.
    pub scripts_dir: Option<PathBuf>,
    pub callback_host: String,
    /// `0` binds an ephemeral port.
    pub callback_port: u16,
    pub request_ceiling: usize,
    pub watchdog_poll_ms: u64,
    pub kill_grace_ms: u64,
    pub module_search_path_var: String,
    /// Keyed by extension kind (`chat`, `symbol-lookup`, ...).
    pub extensions: BTreeMap<String, ExtensionConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            extensions_dir: PathBuf::from(DEFAULT_EXTENSIONS_DIR),
            scripts_dir: None,
            callback_host: DEFAULT_CALLBACK_HOST.to_string(),
            callback_port: 0,
            request_ceiling: DEFAULT_REQUEST_CEILING,
            watchdog_poll_ms: DEFAULT_WATCHDOG_POLL_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            module_search_path_var: DEFAULT_MODULE_SEARCH_PATH_VAR.to_string(),
            extensions: default_extension_table(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("request_ceiling must be greater than 0")]
    ZeroRequestCeiling,
    #[error("watchdog_poll_ms must be greater than 0")]
    ZeroWatchdogPoll,
    #[error("unknown extension kind '{0}' in [extensions]")]
    UnknownExtensionKind(String),
    #[error("extension kind 'terminate' cannot be configured")]
    TerminateNotConfigurable,
    #[error("extension '{0}' must name a non-empty module")]
    EmptyModule(String),
}

/// Every runnable kind maps to a module of the same name; autocomplete is
/// the only persistent one.
pub fn default_extension_table() -> BTreeMap<String, ExtensionConfig> {
    ExtensionKind::RUNNABLE
        .into_iter()
        .map(|kind| {
            let lifecycle = if kind == ExtensionKind::Autocomplete {
                WorkerLifecycle::Persistent
            } else {
                WorkerLifecycle::OnDemand
            };
            (
                kind.as_str().to_string(),
                ExtensionConfig {
                    module: kind.as_str().replace('-', "_"),
                    lifecycle,
                },
            )
        })
        .collect()
}

pub fn load_runtime_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    RuntimeConfig::from_toml_str(&raw)
}

impl RuntimeConfig {
    /// Parses and validates a TOML document. Kinds missing from
    /// `[extensions]` keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: RuntimeConfig =
            toml::from_str(raw).map_err(|error| ConfigError::Parse(error.to_string()))?;
        config.fill_default_extensions();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_ceiling == 0 {
            return Err(ConfigError::ZeroRequestCeiling);
        }
        if self.watchdog_poll_ms == 0 {
            return Err(ConfigError::ZeroWatchdogPoll);
        }
        for (key, extension) in &self.extensions {
            let kind = ExtensionKind::parse(key)
                .ok_or_else(|| ConfigError::UnknownExtensionKind(key.clone()))?;
            if kind.is_terminate() {
                return Err(ConfigError::TerminateNotConfigurable);
            }
            if extension.module.trim().is_empty() {
                return Err(ConfigError::EmptyModule(key.clone()));
            }
        }
        Ok(())
    }

    /// Looks up the extension entry for `kind`, tolerating snake_case keys.
    pub fn extension(&self, kind: ExtensionKind) -> Option<&ExtensionConfig> {
        self.extensions
            .iter()
            .find(|(key, _)| ExtensionKind::parse(key) == Some(kind))
            .map(|(_, extension)| extension)
    }

    pub fn persistent_kinds(&self) -> Vec<ExtensionKind> {
        self.extensions
            .iter()
            .filter(|(_, extension)| extension.lifecycle == WorkerLifecycle::Persistent)
            .filter_map(|(key, _)| ExtensionKind::parse(key))
            .collect()
    }

    pub fn watchdog_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_poll_ms.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.scripts_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    fn fill_default_extensions(&mut self) {
        for (key, extension) in default_extension_table() {
            let Some(kind) = ExtensionKind::parse(&key) else {
                continue;
            };
            if self.extension(kind).is_none() {
                self.extensions.insert(key, extension);
            }
        }
    }
}
