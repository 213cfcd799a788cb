//! Worker supervisors and the process plumbing they share.

mod on_demand;
mod persistent;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use pylon_protocol::{ExtensionKind, InvocationRequest};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{InvocationChannel, InvocationError, RuntimeConfig, WorkerLifecycle};

pub use on_demand::OnDemandSupervisor;
pub use persistent::{PersistentSupervisor, WorkerSnapshot};

const MAX_TEXT_FILE_BUSY_RETRIES: u32 = 5;
const TEXT_FILE_BUSY_ERRNO: i32 = 26;

/// Closed set of execution strategies selected from configuration.
#[derive(Debug, Clone)]
pub enum ExtensionHandler {
    OnDemand(OnDemandSupervisor),
    Persistent(Arc<PersistentSupervisor>),
}

impl ExtensionHandler {
    /// Runs `request` and reports every outcome through `channel`.
    pub async fn execute(&self, channel: Arc<InvocationChannel>, request: InvocationRequest) {
        match self {
            Self::OnDemand(supervisor) => supervisor.execute(channel, request).await,
            Self::Persistent(supervisor) => supervisor.execute(channel, request).await,
        }
    }

    pub fn lifecycle(&self) -> WorkerLifecycle {
        match self {
            Self::OnDemand(_) => WorkerLifecycle::OnDemand,
            Self::Persistent(_) => WorkerLifecycle::Persistent,
        }
    }
}

/// Everything needed to launch a worker for one extension kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTarget {
    pub interpreter: PathBuf,
    pub module_dir: PathBuf,
    pub module_name: String,
}

/// Validates interpreter and module before any process is started.
pub fn resolve_worker_target(
    config: &RuntimeConfig,
    kind: ExtensionKind,
) -> Result<WorkerTarget, InvocationError> {
    let interpreter = config.interpreter.clone().ok_or_else(|| {
        InvocationError::Configuration("worker interpreter is not configured".to_string())
    })?;
    // Bare program names are resolved through PATH at spawn time.
    if interpreter.components().count() > 1 && !interpreter.exists() {
        return Err(InvocationError::Configuration(format!(
            "worker interpreter not found: {}",
            interpreter.display()
        )));
    }

    let extension = config.extension(kind).ok_or_else(|| {
        InvocationError::Configuration(format!("no extension configured for '{kind}'"))
    })?;
    let module_dir = absolutize(&config.extensions_dir);
    let package = module_dir.join(&extension.module);
    let single_file = module_dir.join(format!("{}.py", extension.module));
    if !package.exists() && !single_file.exists() {
        return Err(InvocationError::Configuration(format!(
            "extension module '{}' not found at {}",
            extension.module,
            package.display()
        )));
    }

    Ok(WorkerTarget {
        interpreter,
        module_dir,
        module_name: extension.module.clone(),
    })
}

pub(crate) fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Stdout is discarded; workers report through the callback endpoint.
pub(crate) fn worker_command(
    target: &WorkerTarget,
    script: &Path,
    env: &BTreeMap<String, OsString>,
) -> Command {
    let mut command = Command::new(&target.interpreter);
    command.kill_on_drop(true);
    command.arg(script);
    command.envs(env);
    command.current_dir(&target.module_dir);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::null());
    command.stderr(Stdio::piped());
    command
}

pub(crate) async fn spawn_with_text_file_busy_retry(
    command: &mut Command,
    program: &Path,
) -> Result<Child, InvocationError> {
    for attempt in 0..=MAX_TEXT_FILE_BUSY_RETRIES {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(error) => {
                if error.raw_os_error() == Some(TEXT_FILE_BUSY_ERRNO)
                    && attempt < MAX_TEXT_FILE_BUSY_RETRIES
                {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    continue;
                }
                return Err(InvocationError::Spawn {
                    program: program.display().to_string(),
                    error: error.to_string(),
                });
            }
        }
    }

    Err(InvocationError::Spawn {
        program: program.display().to_string(),
        error: "unknown error".to_string(),
    })
}

/// Buffers every non-empty stderr line until the stream closes.
pub(crate) fn collect_stderr_lines(stderr: ChildStderr, pid: Option<u32>) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut buffered = Vec::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    debug!(pid, line = %line, "worker stderr");
                    buffered.push(line);
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(pid, error = %error, "worker stderr read failed");
                    break;
                }
            }
        }
        buffered
    })
}

/// Sends SIGKILL and waits up to `grace`; if the process is still around,
/// follows up with SIGTERM and waits once more.
pub(crate) async fn kill_with_escalation(
    child: &mut Child,
    grace: Duration,
) -> Result<ExitStatus, InvocationError> {
    let pid = child.id();
    if let Err(error) = child.start_kill() {
        if let Ok(Some(status)) = child.try_wait() {
            return Ok(status);
        }
        debug!(pid, error = %error, "initial kill signal failed");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return Ok(status),
        Ok(Err(error)) => return Err(InvocationError::Runtime(error.to_string())),
        Err(_) => {}
    }

    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            debug!(pid, "escalating worker kill to SIGTERM");
            if let Err(error) = send_sigterm(pid) {
                warn!(pid, error = %error, "SIGTERM escalation failed");
            }
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(error)) => Err(InvocationError::Runtime(error.to_string())),
        Err(_) => Err(InvocationError::Timeout {
            pid: pid.unwrap_or_default(),
            waited_ms: grace.as_millis().saturating_mul(2) as u64,
        }),
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("worker exited with status {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("worker terminated by signal {signal}");
        }
    }
    "worker exited abnormally".to_string()
}
