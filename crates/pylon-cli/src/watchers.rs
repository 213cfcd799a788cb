//! Filesystem watchers that publish invalidation signals.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use pylon_runtime::{
    InvalidationBroadcaster, InvalidationReason, InvalidationSignal, RuntimeContext,
};
use tracing::{debug, info, warn};

use crate::bootstrap_helpers::resolve_runtime_config;
use crate::cli_args::CliOverrides;

fn is_relevant_kind(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

/// Bytecode caches are rewritten by workers themselves and must not trigger
/// a respawn loop.
fn affects_extension_sources(event: &Event) -> bool {
    if event.paths.is_empty() {
        return true;
    }
    event.paths.iter().any(|path| {
        let in_cache = path
            .components()
            .any(|component| component.as_os_str() == "__pycache__");
        let is_bytecode = path
            .extension()
            .is_some_and(|extension| extension == "pyc");
        !in_cache && !is_bytecode
    })
}

fn event_affects_file(event: &Event, watched: &Path) -> bool {
    let watched_name = watched.file_name();
    event.paths.iter().any(|path| {
        path == watched
            || watched_name
                .map(|name| path.file_name() == Some(name))
                .unwrap_or(false)
    })
}

/// Emits [`InvalidationReason::ExtensionsChanged`] for any source change
/// under the extensions directory.
pub(crate) struct ExtensionsDirWatcher {
    signals: InvalidationBroadcaster,
    _watcher: RecommendedWatcher,
}

impl ExtensionsDirWatcher {
    pub(crate) fn start(extensions_dir: &Path) -> Result<Self> {
        let signals = InvalidationBroadcaster::new();
        let emitter = signals.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if is_relevant_kind(&event) && affects_extension_sources(&event) {
                        debug!(paths = ?event.paths, "extensions directory changed");
                        emitter.emit(InvalidationSignal::all(
                            InvalidationReason::ExtensionsChanged,
                        ));
                    }
                }
                Err(error) => warn!(error = %error, "extensions watcher error"),
            }
        })
        .context("failed to initialize extensions watcher")?;
        watcher
            .watch(extensions_dir, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", extensions_dir.display()))?;
        info!(dir = %extensions_dir.display(), "watching extensions directory");
        Ok(Self {
            signals,
            _watcher: watcher,
        })
    }

    pub(crate) fn signals(&self) -> &InvalidationBroadcaster {
        &self.signals
    }
}

/// Reloads the config file on save, swaps it into the runtime context, then
/// emits [`InvalidationReason::ConfigSaved`]. Invalid edits are logged and
/// leave the running config in place.
pub(crate) struct ConfigFileWatcher {
    signals: InvalidationBroadcaster,
    _watcher: RecommendedWatcher,
}

impl ConfigFileWatcher {
    pub(crate) fn start(
        config_path: &Path,
        overrides: CliOverrides,
        context: Arc<RuntimeContext>,
    ) -> Result<Self> {
        let signals = InvalidationBroadcaster::new();
        let emitter = signals.clone();
        let watched: PathBuf = config_path.to_path_buf();
        let reload_path = watched.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(error) => {
                    warn!(error = %error, "config watcher error");
                    return;
                }
            };
            if !is_relevant_kind(&event) || !event_affects_file(&event, &reload_path) {
                return;
            }
            if matches!(event.kind, EventKind::Remove(_)) && !reload_path.exists() {
                debug!(path = %reload_path.display(), "config file removed; keeping current config");
                return;
            }
            match resolve_runtime_config(Some(&reload_path), &overrides) {
                Ok(config) => {
                    context.replace_config(config);
                    emitter.emit(InvalidationSignal::all(InvalidationReason::ConfigSaved));
                }
                Err(error) => {
                    warn!(path = %reload_path.display(), error = %format!("{error:#}"), "config reload rejected");
                }
            }
        })
        .context("failed to initialize config watcher")?;

        let watch_root = match watched.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&watch_root, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", watch_root.display()))?;
        info!(path = %watched.display(), "watching runtime config");
        Ok(Self {
            signals,
            _watcher: watcher,
        })
    }

    pub(crate) fn signals(&self) -> &InvalidationBroadcaster {
        &self.signals
    }
}
