use std::path::PathBuf;

use clap::{ArgAction, Parser};
use pylon_runtime::RuntimeConfig;

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "pylon",
    about = "Extension execution host: reads invocation requests as NDJSON on stdin and streams responses on stdout",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "PYLON_CONFIG",
        help = "Runtime config TOML. Flags below override values from the file."
    )]
    pub(crate) config: Option<PathBuf>,

    #[arg(
        long,
        env = "PYLON_INTERPRETER",
        help = "Interpreter used to run generated adapter scripts."
    )]
    pub(crate) interpreter: Option<PathBuf>,

    #[arg(
        long = "extensions-dir",
        env = "PYLON_EXTENSIONS_DIR",
        help = "Directory containing extension modules."
    )]
    pub(crate) extensions_dir: Option<PathBuf>,

    #[arg(
        long = "scripts-dir",
        env = "PYLON_SCRIPTS_DIR",
        help = "Directory for generated adapter scripts. Defaults to the system temp dir."
    )]
    pub(crate) scripts_dir: Option<PathBuf>,

    #[arg(long = "callback-host", env = "PYLON_CALLBACK_HOST")]
    pub(crate) callback_host: Option<String>,

    #[arg(
        long = "callback-port",
        env = "PYLON_CALLBACK_PORT",
        help = "Callback endpoint port. 0 binds an ephemeral port."
    )]
    pub(crate) callback_port: Option<u16>,

    #[arg(
        long = "request-ceiling",
        env = "PYLON_REQUEST_CEILING",
        value_parser = parse_positive_usize,
        help = "Requests a persistent worker serves before it is replaced."
    )]
    pub(crate) request_ceiling: Option<usize>,

    #[arg(
        long = "watchdog-poll-ms",
        env = "PYLON_WATCHDOG_POLL_MS",
        value_parser = parse_positive_u64
    )]
    pub(crate) watchdog_poll_ms: Option<u64>,

    #[arg(
        long = "kill-grace-ms",
        env = "PYLON_KILL_GRACE_MS",
        value_parser = parse_positive_u64
    )]
    pub(crate) kill_grace_ms: Option<u64>,

    #[arg(
        long = "watch-extensions",
        env = "PYLON_WATCH_EXTENSIONS",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Invalidate persistent workers when the extensions directory changes."
    )]
    pub(crate) watch_extensions: bool,

    #[arg(
        long = "watch-config",
        env = "PYLON_WATCH_CONFIG",
        default_value_t = true,
        action = ArgAction::Set,
        help = "Reload the config file and invalidate persistent workers when it is saved."
    )]
    pub(crate) watch_config: bool,
}

/// Flag values layered over the config file on startup and on every reload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CliOverrides {
    pub(crate) interpreter: Option<PathBuf>,
    pub(crate) extensions_dir: Option<PathBuf>,
    pub(crate) scripts_dir: Option<PathBuf>,
    pub(crate) callback_host: Option<String>,
    pub(crate) callback_port: Option<u16>,
    pub(crate) request_ceiling: Option<usize>,
    pub(crate) watchdog_poll_ms: Option<u64>,
    pub(crate) kill_grace_ms: Option<u64>,
}

impl Cli {
    pub(crate) fn overrides(&self) -> CliOverrides {
        CliOverrides {
            interpreter: self.interpreter.clone(),
            extensions_dir: self.extensions_dir.clone(),
            scripts_dir: self.scripts_dir.clone(),
            callback_host: self.callback_host.clone(),
            callback_port: self.callback_port,
            request_ceiling: self.request_ceiling,
            watchdog_poll_ms: self.watchdog_poll_ms,
            kill_grace_ms: self.kill_grace_ms,
        }
    }
}

impl CliOverrides {
    pub(crate) fn apply(&self, config: &mut RuntimeConfig) {
        if let Some(interpreter) = &self.interpreter {
            config.interpreter = Some(interpreter.clone());
        }
        if let Some(extensions_dir) = &self.extensions_dir {
            config.extensions_dir = extensions_dir.clone();
        }
        if let Some(scripts_dir) = &self.scripts_dir {
            config.scripts_dir = Some(scripts_dir.clone());
        }
        if let Some(callback_host) = &self.callback_host {
            config.callback_host = callback_host.clone();
        }
        if let Some(callback_port) = self.callback_port {
            config.callback_port = callback_port;
        }
        if let Some(request_ceiling) = self.request_ceiling {
            config.request_ceiling = request_ceiling;
        }
        if let Some(watchdog_poll_ms) = self.watchdog_poll_ms {
            config.watchdog_poll_ms = watchdog_poll_ms;
        }
        if let Some(kill_grace_ms) = self.kill_grace_ms {
            config.kill_grace_ms = kill_grace_ms;
        }
    }
}
