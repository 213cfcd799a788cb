//! One worker process per invocation.

use std::io;
use std::sync::Arc;

use pylon_protocol::InvocationRequest;
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{
    collect_stderr_lines, describe_exit, kill_with_escalation, resolve_worker_target,
    spawn_with_text_file_busy_retry, worker_command,
};
use crate::{remove_runner_script, InvocationChannel, InvocationError, RuntimeContext};

enum WorkerOutcome {
    Exited(io::Result<std::process::ExitStatus>),
    Terminated,
}

#[derive(Debug, Clone)]
pub struct OnDemandSupervisor {
    context: Arc<RuntimeContext>,
}

impl OnDemandSupervisor {
    pub fn new(context: Arc<RuntimeContext>) -> Self {
        Self { context }
    }

    /// Spawns a worker, writes the request as one JSON line, closes stdin, and
    /// supervises the process until it exits or the channel is terminated.
    pub async fn execute(&self, channel: Arc<InvocationChannel>, request: InvocationRequest) {
        let config = self.context.config();
        let invocation_id = request.invocation_id.clone();
        let kind = request.extension_kind;

        let target = match resolve_worker_target(&config, kind) {
            Ok(target) => target,
            Err(error) => {
                warn!(%invocation_id, %kind, error = %error, "on-demand worker not started");
                channel.fail(&error);
                return;
            }
        };
        let line = match request.to_stdin_line() {
            Ok(line) => line,
            Err(error) => {
                channel.fail(&InvocationError::Protocol(format!(
                    "failed to encode invocation request: {error}"
                )));
                return;
            }
        };

        let builder = self.context.script_builder();
        let script = match builder.build_on_demand(&target.module_dir, &target.module_name) {
            Ok(script) => script,
            Err(error) => {
                channel.fail(&InvocationError::Spawn {
                    program: target.interpreter.display().to_string(),
                    error: format!("failed to write runner script: {error}"),
                });
                return;
            }
        };
        let env = match builder.build_env(&target.module_dir, &invocation_id, self.context.callback_addr()) {
            Ok(env) => env,
            Err(error) => {
                remove_runner_script(&script);
                channel.fail(&InvocationError::Spawn {
                    program: target.interpreter.display().to_string(),
                    error: format!("failed to build worker environment: {error}"),
                });
                return;
            }
        };

        let mut command = worker_command(&target, &script, &env);
        let mut child = match spawn_with_text_file_busy_retry(&mut command, &target.interpreter).await
        {
            Ok(child) => child,
            Err(error) => {
                error!(%invocation_id, %kind, error = %error, "on-demand worker spawn failed");
                remove_runner_script(&script);
                channel.fail(&error);
                return;
            }
        };
        let pid = child.id();
        info!(%invocation_id, %kind, pid, "on-demand worker spawned");

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| collect_stderr_lines(stderr, pid));

        // The write runs beside the watchdog; a worker that never drains its
        // stdin must still be killable.
        let stdin_write = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            })
        });

        let grace = config.kill_grace();
        let mut watchdog = tokio::time::interval(config.watchdog_poll_interval());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let outcome = loop {
            tokio::select! {
                status = child.wait() => break WorkerOutcome::Exited(status),
                _ = watchdog.tick() => {
                    if channel.is_terminated() {
                        break WorkerOutcome::Terminated;
                    }
                }
            }
        };

        if let Some(mut write) = stdin_write {
            if matches!(outcome, WorkerOutcome::Terminated) {
                write.abort();
            } else {
                match tokio::time::timeout(grace, &mut write).await {
                    Ok(Ok(Ok(()))) => {}
                    // The worker may exit before reading its input.
                    Ok(Ok(Err(error))) if error.kind() == io::ErrorKind::BrokenPipe => {
                        debug!(%invocation_id, pid, "worker closed stdin before request was written");
                    }
                    Ok(Ok(Err(error))) => {
                        channel.fail(&InvocationError::Runtime(format!(
                            "failed to write request to worker: {error}"
                        )));
                    }
                    Ok(Err(error)) => {
                        warn!(%invocation_id, pid, error = %error, "request write task failed");
                    }
                    Err(_) => {
                        debug!(%invocation_id, pid, "request write still pending after worker exit");
                        write.abort();
                    }
                }
            }
        }

        let status = match outcome {
            WorkerOutcome::Exited(Ok(status)) => Some(status),
            WorkerOutcome::Exited(Err(error)) => {
                channel.fail(&InvocationError::Runtime(format!(
                    "failed to wait for worker: {error}"
                )));
                None
            }
            WorkerOutcome::Terminated => {
                // Stop response first, then the kill.
                channel.terminate();
                debug!(%invocation_id, pid, "watchdog killing terminated worker");
                match kill_with_escalation(&mut child, grace).await {
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%invocation_id, pid, error = %error, "worker kill escalation failed");
                    }
                }
                None
            }
        };

        if let Some(stderr_task) = stderr_task {
            let lines = match tokio::time::timeout(grace, stderr_task).await {
                Ok(Ok(lines)) => lines,
                _ => Vec::new(),
            };
            if !lines.is_empty() {
                channel.fail(&InvocationError::Runtime(lines.join("\n")));
            }
        }
        if let Some(status) = status {
            if !status.success() {
                channel.fail(&InvocationError::Runtime(describe_exit(status)));
            }
            info!(%invocation_id, %kind, pid, status = %status, "on-demand worker exited");
        }

        channel.terminate();
        remove_runner_script(&script);
    }
}
