//! One long-lived worker per extension kind, reused across invocations.
//!
//! Records are replaced when the process dies, when an invalidation signal
//! marks them dirty, or when they reach the configured request ceiling. The
//! invocation that hits the ceiling still runs on the old process; the next
//! dispatch spawns a replacement.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use pylon_protocol::{ExtensionKind, InvocationRequest};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{
    collect_stderr_lines, describe_exit, kill_with_escalation, resolve_worker_target,
    spawn_with_text_file_busy_retry, worker_command,
};
use crate::{
    lock_or_recover, remove_runner_script, InvalidationListener, InvalidationSignal,
    InvalidationSource, InvocationChannel, InvocationError, RuntimeConfig, RuntimeContext,
    PROCESS_REQUEST_SENTINEL,
};

type WorkerTable = Mutex<HashMap<ExtensionKind, WorkerRecord>>;
type InFlightSlot = Arc<Mutex<Option<Arc<InvocationChannel>>>>;

#[derive(Debug)]
struct WorkerRecord {
    generation: u64,
    pid: Option<u32>,
    extension_kind: ExtensionKind,
    requests_served: usize,
    is_dirty: bool,
    alive: Arc<AtomicBool>,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    in_flight: InFlightSlot,
    kill_switch: Option<oneshot::Sender<()>>,
}

impl WorkerRecord {
    fn is_reusable(&self, request_ceiling: usize) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.is_dirty && self.requests_served < request_ceiling
    }

    fn count_request(&mut self, request_ceiling: usize) {
        self.requests_served += 1;
        if self.requests_served >= request_ceiling {
            debug!(
                kind = %self.extension_kind,
                pid = self.pid,
                requests_served = self.requests_served,
                "persistent worker reached request ceiling"
            );
            self.is_dirty = true;
        }
    }

    fn lease(&self) -> WorkerLease {
        WorkerLease {
            generation: self.generation,
            pid: self.pid,
            stdin: Arc::clone(&self.stdin),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Asks the monitor task to kill the process. The resulting exit is
    /// treated as intentional and reports nothing to the in-flight channel.
    fn retire(mut self) -> Arc<AtomicBool> {
        if let Some(kill_switch) = self.kill_switch.take() {
            let _ = kill_switch.send(());
        }
        self.alive
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            extension_kind: self.extension_kind,
            pid: self.pid,
            requests_served: self.requests_served,
            is_dirty: self.is_dirty,
            alive: self.alive.load(Ordering::SeqCst),
        }
    }
}

struct WorkerLease {
    generation: u64,
    pid: Option<u32>,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    in_flight: InFlightSlot,
}

/// Point-in-time view of a persistent worker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub extension_kind: ExtensionKind,
    pub pid: Option<u32>,
    pub requests_served: usize,
    pub is_dirty: bool,
    pub alive: bool,
}

struct WorkerMonitor {
    child: Child,
    extension_kind: ExtensionKind,
    generation: u64,
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    in_flight: InFlightSlot,
    stderr_task: Option<JoinHandle<Vec<String>>>,
    script: PathBuf,
    kill_grace: Duration,
    workers: Weak<WorkerTable>,
}

#[derive(Debug)]
pub struct PersistentSupervisor {
    context: Arc<RuntimeContext>,
    workers: Arc<WorkerTable>,
    /// Serializes get-or-create per kind. Request writes are serialized by
    /// each worker's stdin lock.
    spawn_locks: Mutex<HashMap<ExtensionKind, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: AtomicU64,
}

impl PersistentSupervisor {
    pub fn new(context: Arc<RuntimeContext>) -> Self {
        Self {
            context,
            workers: Arc::new(Mutex::new(HashMap::new())),
            spawn_locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Sends the sentinel and request line to the kind's worker, spawning or
    /// replacing it first when the current record is not reusable. Results
    /// arrive later through the callback endpoint.
    pub async fn execute(&self, channel: Arc<InvocationChannel>, request: InvocationRequest) {
        let config = self.context.config();
        let kind = request.extension_kind;
        let invocation_id = request.invocation_id.clone();

        let line = match request.to_stdin_line() {
            Ok(line) => line,
            Err(error) => {
                channel.fail(&InvocationError::Protocol(format!(
                    "failed to encode invocation request: {error}"
                )));
                return;
            }
        };
        let spawn_lock = self.spawn_lock(kind);
        let spawning = spawn_lock.lock().await;
        let acquired = self.acquire(kind, &config, &invocation_id).await;
        drop(spawning);
        let lease = match acquired {
            Ok(lease) => lease,
            Err(error) => {
                warn!(%invocation_id, %kind, error = %error, "persistent worker unavailable");
                channel.fail(&error);
                return;
            }
        };

        *lock_or_recover(&lease.in_flight) = Some(Arc::clone(&channel));
        let payload = format!("{PROCESS_REQUEST_SENTINEL}\n{line}");
        let write = async {
            let mut stdin = lease.stdin.lock().await;
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        };
        tokio::pin!(write);
        let mut watchdog = tokio::time::interval(config.watchdog_poll_interval());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let written = loop {
            tokio::select! {
                biased;
                result = &mut write => break Some(result),
                _ = watchdog.tick() => {
                    if channel.is_terminated() {
                        break None;
                    }
                }
            }
        };
        match written {
            Some(Ok(())) => {
                debug!(%invocation_id, %kind, pid = lease.pid, "request dispatched to persistent worker");
            }
            Some(Err(error)) => {
                warn!(%invocation_id, %kind, pid = lease.pid, error = %error, "persistent worker stdin write failed");
                self.discard(kind, lease.generation);
                channel.fail(&InvocationError::Runtime(format!(
                    "failed to write request to persistent worker: {error}"
                )));
            }
            // A half-written request leaves the worker's input unusable.
            None => {
                warn!(%invocation_id, %kind, pid = lease.pid, "invocation terminated while request write was pending; retiring worker");
                self.discard(kind, lease.generation);
            }
        }
    }

    /// Marks every matching record dirty. Returns how many were marked.
    pub fn invalidate(&self, signal: InvalidationSignal) -> usize {
        let mut workers = lock_or_recover(&self.workers);
        let mut marked = 0;
        for record in workers.values_mut() {
            if signal.applies_to(record.extension_kind) {
                record.is_dirty = true;
                marked += 1;
            }
        }
        if marked > 0 {
            info!(reason = %signal.reason, marked, "persistent workers invalidated");
        }
        marked
    }

    /// Listener suitable for any [`InvalidationSource`]. Holds only a weak
    /// reference, so subscribing does not keep the supervisor alive.
    pub fn on_invalidate(self: &Arc<Self>) -> InvalidationListener {
        let supervisor = Arc::downgrade(self);
        Arc::new(move |signal| {
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.invalidate(signal);
            }
        })
    }

    pub fn attach(self: &Arc<Self>, source: &dyn InvalidationSource) {
        source.subscribe(self.on_invalidate());
    }

    /// Pid of the live worker for `kind`, if any.
    pub fn worker_pid(&self, kind: ExtensionKind) -> Option<u32> {
        lock_or_recover(&self.workers)
            .get(&kind)
            .filter(|record| record.alive.load(Ordering::SeqCst))
            .and_then(|record| record.pid)
    }

    pub fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots = lock_or_recover(&self.workers)
            .values()
            .map(WorkerRecord::snapshot)
            .collect::<Vec<_>>();
        snapshots.sort_by_key(|snapshot| snapshot.extension_kind);
        snapshots
    }

    /// Kills every worker and waits, bounded by the kill grace, for them to
    /// exit. Returns the number of workers retired.
    pub async fn shutdown(&self) -> usize {
        let records = lock_or_recover(&self.workers)
            .drain()
            .map(|(_, record)| record)
            .collect::<Vec<_>>();
        let retired = records.len();
        let alive_flags = records
            .into_iter()
            .map(WorkerRecord::retire)
            .collect::<Vec<_>>();

        let deadline = Instant::now() + self.context.config().kill_grace() * 2;
        while alive_flags.iter().any(|alive| alive.load(Ordering::SeqCst)) {
            if Instant::now() >= deadline {
                warn!("persistent workers still running after shutdown grace");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if retired > 0 {
            info!(retired, "persistent workers shut down");
        }
        retired
    }

    fn spawn_lock(&self, kind: ExtensionKind) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(lock_or_recover(&self.spawn_locks).entry(kind).or_default())
    }

    async fn acquire(
        &self,
        kind: ExtensionKind,
        config: &RuntimeConfig,
        invocation_id: &str,
    ) -> Result<WorkerLease, InvocationError> {
        let stale = {
            let mut workers = lock_or_recover(&self.workers);
            let reusable = workers
                .get(&kind)
                .is_some_and(|record| record.is_reusable(config.request_ceiling));
            if reusable {
                if let Some(record) = workers.get_mut(&kind) {
                    record.count_request(config.request_ceiling);
                    return Ok(record.lease());
                }
            }
            workers.remove(&kind)
        };
        if let Some(stale) = stale {
            info!(
                %kind,
                pid = stale.pid,
                requests_served = stale.requests_served,
                is_dirty = stale.is_dirty,
                "replacing persistent worker"
            );
            stale.retire();
        }

        let mut record = self.spawn_worker(kind, config, invocation_id).await?;
        record.count_request(config.request_ceiling);
        let lease = record.lease();
        lock_or_recover(&self.workers).insert(kind, record);
        Ok(lease)
    }

    async fn spawn_worker(
        &self,
        kind: ExtensionKind,
        config: &RuntimeConfig,
        invocation_id: &str,
    ) -> Result<WorkerRecord, InvocationError> {
        let target = resolve_worker_target(config, kind)?;
        let callback = self.context.callback_addr().ok_or_else(|| {
            InvocationError::Configuration(
                "callback endpoint is not bound; persistent workers need HOST and PORT".to_string(),
            )
        })?;
        let spawn_error = |error: String| InvocationError::Spawn {
            program: target.interpreter.display().to_string(),
            error,
        };

        let builder = self.context.script_builder();
        let script = builder
            .build_persistent(&target.module_dir, &target.module_name)
            .map_err(|error| spawn_error(format!("failed to write runner script: {error}")))?;
        let env = match builder.build_env(&target.module_dir, invocation_id, Some(callback)) {
            Ok(env) => env,
            Err(error) => {
                remove_runner_script(&script);
                return Err(spawn_error(format!(
                    "failed to build worker environment: {error}"
                )));
            }
        };

        let mut command = worker_command(&target, &script, &env);
        let mut child = match spawn_with_text_file_busy_retry(&mut command, &target.interpreter).await
        {
            Ok(child) => child,
            Err(error) => {
                remove_runner_script(&script);
                return Err(error);
            }
        };
        let pid = child.id();
        let Some(stdin) = child.stdin.take() else {
            drop(child);
            remove_runner_script(&script);
            return Err(spawn_error("worker stdin unavailable".to_string()));
        };
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| collect_stderr_lines(stderr, pid));

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        let in_flight: InFlightSlot = Arc::new(Mutex::new(None));
        let (kill_switch, kill_rx) = oneshot::channel();
        tokio::spawn(monitor_worker(
            WorkerMonitor {
                child,
                extension_kind: kind,
                generation,
                pid,
                alive: Arc::clone(&alive),
                in_flight: Arc::clone(&in_flight),
                stderr_task,
                script,
                kill_grace: config.kill_grace(),
                workers: Arc::downgrade(&self.workers),
            },
            kill_rx,
        ));
        info!(%kind, pid, generation, "persistent worker spawned");

        Ok(WorkerRecord {
            generation,
            pid,
            extension_kind: kind,
            requests_served: 0,
            is_dirty: false,
            alive,
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            in_flight,
            kill_switch: Some(kill_switch),
        })
    }

    fn discard(&self, kind: ExtensionKind, generation: u64) {
        let stale = {
            let mut workers = lock_or_recover(&self.workers);
            if workers
                .get(&kind)
                .is_some_and(|record| record.generation == generation)
            {
                workers.remove(&kind)
            } else {
                None
            }
        };
        if let Some(stale) = stale {
            stale.retire();
        }
    }
}

async fn monitor_worker(mut monitor: WorkerMonitor, kill_rx: oneshot::Receiver<()>) {
    let kind = monitor.extension_kind;
    let pid = monitor.pid;
    // A dropped kill switch means the record was discarded; treat it as a kill.
    let (status, intentional): (Option<ExitStatus>, bool) = tokio::select! {
        status = monitor.child.wait() => (status.ok(), false),
        _ = kill_rx => {
            match kill_with_escalation(&mut monitor.child, monitor.kill_grace).await {
                Ok(status) => (Some(status), true),
                Err(error) => {
                    warn!(%kind, pid, error = %error, "persistent worker kill escalation failed");
                    (None, true)
                }
            }
        }
    };
    monitor.alive.store(false, Ordering::SeqCst);

    if let Some(workers) = monitor.workers.upgrade() {
        let stale = {
            let mut workers = lock_or_recover(&workers);
            if workers
                .get(&kind)
                .is_some_and(|record| record.generation == monitor.generation)
            {
                workers.remove(&kind)
            } else {
                None
            }
        };
        drop(stale);
    }

    let lines = match monitor.stderr_task.take() {
        Some(task) => match tokio::time::timeout(monitor.kill_grace, task).await {
            Ok(Ok(lines)) => lines,
            _ => Vec::new(),
        },
        None => Vec::new(),
    };
    let in_flight = lock_or_recover(&monitor.in_flight).take();

    if intentional {
        debug!(%kind, pid, "persistent worker retired");
    } else {
        let message = if lines.is_empty() {
            status
                .map(describe_exit)
                .unwrap_or_else(|| "persistent worker exited".to_string())
        } else {
            lines.join("\n")
        };
        error!(%kind, pid, message = %message, "persistent worker exited unexpectedly");
        if let Some(channel) = in_flight {
            channel.fail(&InvocationError::Runtime(message));
        }
    }
    remove_runner_script(&monitor.script);
}
