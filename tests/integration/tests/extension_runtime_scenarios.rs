#![cfg(unix)]

use std::{
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use pylon_gateway::{bind_callback_listener, serve_callback_endpoint};
use pylon_protocol::{ExtensionKind, InvocationRequest, Response};
use pylon_runtime::{
    DeliverFn, DispatchRouter, InvalidationBroadcaster, InvalidationReason, InvalidationSignal,
    RuntimeConfig, RuntimeContext,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::task::JoinHandle;

const EXTENSION_MODULES: [&str; 3] = ["apply", "chat", "autocomplete"];

struct Host {
    temp: TempDir,
    router: Arc<DispatchRouter>,
    context: Arc<RuntimeContext>,
    responses: Arc<Mutex<Vec<Response>>>,
    callback_addr: SocketAddr,
    server: JoinHandle<()>,
}

impl Drop for Host {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Writes a `/bin/sh` interpreter standing in for the real one. `$TMP` in
/// `body` expands to the fixture directory.
fn write_fake_interpreter(root: &Path, body: &str) -> PathBuf {
    let path = root.join("fake-python");
    let body = body.replace("$TMP", &root.display().to_string());
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write interpreter");
    let mut permissions = std::fs::metadata(&path)
        .expect("interpreter metadata")
        .permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod interpreter");
    path
}

async fn start_host(interpreter_body: &str, tune: impl FnOnce(&mut RuntimeConfig)) -> Host {
    let temp = tempfile::tempdir().expect("tempdir");
    let extensions_dir = temp.path().join("extensions");
    for module in EXTENSION_MODULES {
        std::fs::create_dir_all(extensions_dir.join(module)).expect("extension module");
    }
    let mut config = RuntimeConfig {
        interpreter: Some(write_fake_interpreter(temp.path(), interpreter_body)),
        extensions_dir,
        scripts_dir: Some(temp.path().join("scripts")),
        watchdog_poll_ms: 20,
        kill_grace_ms: 500,
        ..RuntimeConfig::default()
    };
    tune(&mut config);

    let listener = bind_callback_listener("127.0.0.1", 0)
        .await
        .expect("bind callback endpoint");
    let callback_addr = listener.local_addr().expect("callback addr");
    let context = Arc::new(RuntimeContext::new(config, Some(callback_addr)));

    let responses = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&responses);
    let sink: DeliverFn = Arc::new(move |response| {
        recorded.lock().expect("responses lock").push(response);
    });
    let router = Arc::new(DispatchRouter::new(Arc::clone(&context), sink));
    let server = tokio::spawn({
        let router = Arc::clone(&router);
        async move {
            let _ = serve_callback_endpoint(listener, router, std::future::pending()).await;
        }
    });

    Host {
        temp,
        router,
        context,
        responses,
        callback_addr,
        server,
    }
}

impl Host {
    fn responses_for(&self, invocation_id: &str) -> Vec<Response> {
        self.responses
            .lock()
            .expect("responses lock")
            .iter()
            .filter(|response| response.invocation_id == invocation_id)
            .cloned()
            .collect()
    }

    async fn dispatch(&self, request: InvocationRequest) -> Option<JoinHandle<()>> {
        self.router.on_receive(request)
    }

    async fn dispatch_and_wait(&self, request: InvocationRequest) {
        if let Some(task) = self.dispatch(request).await {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("invocation task finished")
                .expect("join invocation task");
        }
    }

    async fn post_callback(&self, body: Value) -> u16 {
        reqwest::Client::new()
            .post(format!("http://{}/invocations/worker", self.callback_addr))
            .json(&body)
            .send()
            .await
            .expect("post callback")
            .status()
            .as_u16()
    }

    fn autocomplete_pid(&self) -> Option<u32> {
        self.router.persistent().worker_pid(ExtensionKind::Autocomplete)
    }
}

fn assert_single_terminal(responses: &[Response]) {
    let terminal = responses
        .iter()
        .position(|response| response.is_stopped)
        .expect("terminal response delivered");
    assert_eq!(terminal, responses.len() - 1, "terminal response must be last");
    assert_eq!(
        responses.iter().filter(|response| response.is_stopped).count(),
        1
    );
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[cfg(target_os = "linux")]
fn process_exists(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[tokio::test]
async fn integration_missing_interpreter_path_yields_single_error_and_empty_registry() {
    let host = start_host("exit 0", |config| {
        config.interpreter = Some(PathBuf::from("/opt/pylon-missing/bin/python3"));
    })
    .await;

    host.dispatch_and_wait(InvocationRequest::new("inv-apply", ExtensionKind::Apply))
        .await;

    let responses = host.responses_for("inv-apply");
    assert_eq!(responses.len(), 1);
    assert!(responses[0].is_stopped);
    assert!(responses[0]
        .error_message()
        .is_some_and(|message| message.contains("/opt/pylon-missing/bin/python3")));
    assert!(host.router.active_invocations().is_empty());
}

#[tokio::test]
async fn integration_on_demand_stderr_lines_join_into_terminal_error() {
    let host = start_host(
        "echo 'Traceback (most recent call last):' >&2\necho '  File \"chat.py\", line 3' >&2\necho 'ValueError: bad context' >&2\nexit 0",
        |_| {},
    )
    .await;

    host.dispatch_and_wait(
        InvocationRequest::new("inv-stderr", ExtensionKind::Chat)
            .with_context_field("prompt", json!("explain")),
    )
    .await;

    let responses = host.responses_for("inv-stderr");
    assert_single_terminal(&responses);
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0].error_message(),
        Some("Traceback (most recent call last):\n  File \"chat.py\", line 3\nValueError: bad context")
    );
    assert!(host.router.active_invocations().is_empty());
}

#[tokio::test]
async fn integration_persistent_worker_is_replaced_exactly_at_ceiling_plus_one() {
    let host = start_host("exec cat > /dev/null", |_| {}).await;

    let mut pids = Vec::with_capacity(260);
    for index in 0..260 {
        host.dispatch_and_wait(InvocationRequest::new(
            format!("inv-{index}"),
            ExtensionKind::Autocomplete,
        ))
        .await;
        pids.push(host.autocomplete_pid().expect("live autocomplete worker"));
    }

    let replacements = pids
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[0] != pair[1])
        .map(|(index, _)| index + 1)
        .collect::<Vec<_>>();
    assert_eq!(replacements, vec![250]);
    assert_ne!(pids[249], pids[250]);
    assert_eq!(host.router.persistent().snapshots()[0].requests_served, 10);
    host.router.shutdown().await;
}

#[tokio::test]
async fn integration_unsolicited_callback_is_rejected_without_registry_mutation() {
    let host = start_host("exec sleep 30", |_| {}).await;
    let task = host
        .dispatch(InvocationRequest::new("inv-live", ExtensionKind::Chat))
        .await
        .expect("dispatch task");

    let status = host
        .post_callback(json!({
            "method": "progress",
            "content": 10,
            "meta": {"invocation_id": "inv-ghost", "request_id": "req-1"}
        }))
        .await;
    assert_eq!(status, 404);
    assert_eq!(host.router.active_invocations(), vec!["inv-live".to_string()]);
    assert!(host.responses_for("inv-ghost").is_empty());
    assert!(host.responses_for("inv-live").is_empty());

    host.router.on_receive(InvocationRequest::terminate("inv-live"));
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("worker stopped")
        .expect("join");
}

#[tokio::test]
async fn integration_terminating_one_on_demand_invocation_leaves_the_other_running() {
    let host = start_host(
        "if [ \"$EXTENSION_UUID\" = \"inv-a\" ]; then exec sleep 30; fi\nsleep 1\necho done >&2\nexit 0",
        |_| {},
    )
    .await;
    let task_a = host
        .dispatch(InvocationRequest::new("inv-a", ExtensionKind::Chat))
        .await
        .expect("dispatch a");
    let task_b = host
        .dispatch(InvocationRequest::new("inv-b", ExtensionKind::Chat))
        .await
        .expect("dispatch b");

    tokio::time::sleep(Duration::from_millis(100)).await;
    host.router.on_receive(InvocationRequest::terminate("inv-a"));
    tokio::time::timeout(Duration::from_secs(5), task_a)
        .await
        .expect("a stopped")
        .expect("join a");

    let a = host.responses_for("inv-a");
    assert_single_terminal(&a);
    assert!(a[0].error.is_none());
    assert!(host.responses_for("inv-b").is_empty());
    assert_eq!(host.router.active_invocations(), vec!["inv-b".to_string()]);

    tokio::time::timeout(Duration::from_secs(10), task_b)
        .await
        .expect("b finished")
        .expect("join b");
    let b = host.responses_for("inv-b");
    assert_single_terminal(&b);
    assert_eq!(b[0].error_message(), Some("done"));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn integration_on_demand_terminate_kills_worker_process() {
    let host = start_host(
        "echo $$ > \"$TMP/$EXTENSION_UUID.pid\"\nexec sleep 30",
        |_| {},
    )
    .await;
    let task = host
        .dispatch(InvocationRequest::new("inv-kill", ExtensionKind::Chat))
        .await
        .expect("dispatch");

    let pid_file = host.temp.path().join("inv-kill.pid");
    assert!(wait_until(|| std::fs::read_to_string(&pid_file)
        .map(|raw| !raw.trim().is_empty())
        .unwrap_or(false))
    .await);
    let pid: u32 = std::fs::read_to_string(&pid_file)
        .expect("pid file")
        .trim()
        .parse()
        .expect("pid");
    assert!(process_exists(pid));

    host.router.on_receive(InvocationRequest::terminate("inv-kill"));
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("kill within bound")
        .expect("join");
    assert!(!process_exists(pid));
    assert_single_terminal(&host.responses_for("inv-kill"));
}

#[tokio::test]
async fn integration_persistent_callbacks_stream_until_error_and_worker_survives() {
    let host = start_host("exec cat > /dev/null", |_| {}).await;
    host.dispatch_and_wait(
        InvocationRequest::new("inv-complete", ExtensionKind::Autocomplete)
            .with_request_id("req-1"),
    )
    .await;
    let pid = host.autocomplete_pid().expect("worker pid");

    let status = host
        .post_callback(json!({
            "method": "autocomplete_suggestions",
            "results": [{"label": "println!"}],
            "meta": {"invocation_id": "inv-complete", "request_id": "req-1"}
        }))
        .await;
    assert_eq!(status, 200);
    let status = host
        .post_callback(json!({
            "method": "error",
            "content": "index unavailable",
            "meta": {"invocation_id": "inv-complete", "request_id": "req-1"}
        }))
        .await;
    assert_eq!(status, 200);

    let responses = host.responses_for("inv-complete");
    assert_single_terminal(&responses);
    assert_eq!(responses.len(), 2);
    assert_eq!(
        responses[0].autocomplete_suggestions,
        Some(json!([{"label": "println!"}]))
    );
    assert_eq!(responses[0].request_id.as_deref(), Some("req-1"));
    assert_eq!(responses[1].error_message(), Some("index unavailable"));
    assert!(host.router.get_channel("inv-complete").is_none());

    host.dispatch_and_wait(InvocationRequest::new("inv-next", ExtensionKind::Autocomplete))
        .await;
    assert_eq!(host.autocomplete_pid(), Some(pid));
    host.router.shutdown().await;
}

#[tokio::test]
async fn integration_persistent_terminate_keeps_worker_process() {
    let host = start_host("exec cat > /dev/null", |_| {}).await;
    host.dispatch_and_wait(InvocationRequest::new("inv-1", ExtensionKind::Autocomplete))
        .await;
    let pid = host.autocomplete_pid().expect("worker pid");

    host.router.on_receive(InvocationRequest::terminate("inv-1"));
    assert_single_terminal(&host.responses_for("inv-1"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    #[cfg(target_os = "linux")]
    assert!(process_exists(pid));

    host.dispatch_and_wait(InvocationRequest::new("inv-2", ExtensionKind::Autocomplete))
        .await;
    assert_eq!(host.autocomplete_pid(), Some(pid));
    host.router.shutdown().await;
}

#[tokio::test]
async fn integration_file_change_and_config_save_signals_force_respawn() {
    let host = start_host("exec cat > /dev/null", |_| {}).await;
    let file_changes = InvalidationBroadcaster::new();
    let config_saves = InvalidationBroadcaster::new();
    host.router.persistent().attach(&file_changes);
    host.router.persistent().attach(&config_saves);

    host.dispatch_and_wait(InvocationRequest::new("inv-1", ExtensionKind::Autocomplete))
        .await;
    let first = host.autocomplete_pid().expect("first pid");

    file_changes.emit(InvalidationSignal::all(InvalidationReason::ExtensionsChanged));
    host.dispatch_and_wait(InvocationRequest::new("inv-2", ExtensionKind::Autocomplete))
        .await;
    let second = host.autocomplete_pid().expect("second pid");
    assert_ne!(first, second);

    let mut reloaded = (*host.context.config()).clone();
    reloaded.request_ceiling = 500;
    host.context.replace_config(reloaded);
    config_saves.emit(InvalidationSignal::all(InvalidationReason::ConfigSaved));
    host.dispatch_and_wait(InvocationRequest::new("inv-3", ExtensionKind::Autocomplete))
        .await;
    let third = host.autocomplete_pid().expect("third pid");
    assert_ne!(second, third);
    assert_ne!(first, third);

    #[cfg(target_os = "linux")]
    assert!(wait_until(|| !process_exists(first) && !process_exists(second)).await);
    host.router.shutdown().await;
}
