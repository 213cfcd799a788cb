//! Runs the generated adapters under a real `python3`. Each test returns early
//! when no interpreter is on `PATH`.

#![cfg(unix)]

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use pylon_gateway::{bind_callback_listener, serve_callback_endpoint};
use pylon_protocol::{ExtensionKind, InvocationRequest, Response};
use pylon_runtime::{DeliverFn, DispatchRouter, RuntimeConfig, RuntimeContext};
use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinHandle;

const CALLBACK_HELPER: &str = r#"import json
import os
import urllib.request

OPENER = urllib.request.build_opener(urllib.request.ProxyHandler({}))


def post(method, invocation_id, content):
    body = json.dumps(
        {"method": method, "content": content, "meta": {"invocation_id": invocation_id}}
    ).encode("utf-8")
    request = urllib.request.Request(
        "http://%s:%s/invocations/%s" % (os.environ["HOST"], os.environ["PORT"], invocation_id),
        data=body,
        headers={"Content-Type": "application/json"},
        method="POST",
    )
    OPENER.open(request, timeout=5).read()
"#;

const CHAT_MODULE: &str = r#"import os

import pylon_callback


def run(payload):
    search_path = os.environ["PYTHONPATH"].split(os.pathsep)
    pylon_callback.post(
        "log",
        payload["invocation_id"],
        {"prompt": payload["prompt"], "search_path_head": search_path[0]},
    )
"#;

const APPLY_MODULE: &str = r#"def extension(payload):
    raise ValueError("bad patch %s" % payload["invocation_id"])
"#;

const AUTOCOMPLETE_MODULE: &str = r#"def extension(payload):
    raise RuntimeError("boom %s" % payload["invocation_id"])
"#;

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn write_module(root: &Path, relative: &str, source: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("module dir");
    }
    std::fs::write(path, source).expect("write module");
}

struct PythonHost {
    _temp: TempDir,
    extensions_dir: PathBuf,
    router: Arc<DispatchRouter>,
    responses: Arc<Mutex<Vec<Response>>>,
    server: JoinHandle<()>,
}

impl Drop for PythonHost {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl PythonHost {
    fn responses_for(&self, invocation_id: &str) -> Vec<Response> {
        self.responses
            .lock()
            .expect("responses lock")
            .iter()
            .filter(|response| response.invocation_id == invocation_id)
            .cloned()
            .collect()
    }

    async fn run_to_completion(&self, request: InvocationRequest) {
        let invocation_id = request.invocation_id.clone();
        if let Some(task) = self.router.on_receive(request) {
            tokio::time::timeout(Duration::from_secs(20), task)
                .await
                .expect("invocation task finished")
                .expect("join invocation task");
        }
        let finished = wait_until(|| {
            self.responses_for(&invocation_id)
                .iter()
                .any(|response| response.is_stopped)
        })
        .await;
        assert!(finished, "{invocation_id} never produced a terminal response");
    }
}

async fn start_python_host() -> PythonHost {
    let temp = tempfile::tempdir().expect("tempdir");
    let extensions_dir = temp.path().join("extensions");
    write_module(&extensions_dir, "pylon_callback.py", CALLBACK_HELPER);
    write_module(&extensions_dir, "chat/__init__.py", CHAT_MODULE);
    write_module(&extensions_dir, "chat/settings.py", "ENTRY_POINT = \"run\"\n");
    write_module(&extensions_dir, "apply.py", APPLY_MODULE);
    write_module(&extensions_dir, "autocomplete/__init__.py", AUTOCOMPLETE_MODULE);

    let config = RuntimeConfig {
        interpreter: Some(PathBuf::from("python3")),
        extensions_dir: extensions_dir.clone(),
        scripts_dir: Some(temp.path().join("scripts")),
        watchdog_poll_ms: 20,
        kill_grace_ms: 1_000,
        ..RuntimeConfig::default()
    };
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
    let router = Arc::new(DispatchRouter::new(context, sink));
    let server = tokio::spawn({
        let router = Arc::clone(&router);
        async move {
            let _ = serve_callback_endpoint(listener, router, std::future::pending()).await;
        }
    });

    PythonHost {
        _temp: temp,
        extensions_dir,
        router,
        responses,
        server,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn integration_python_on_demand_settings_entry_point_posts_callback() {
    if !python3_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    let host = start_python_host().await;

    host.run_to_completion(
        InvocationRequest::new("inv-chat", ExtensionKind::Chat)
            .with_context_field("prompt", json!("explain this")),
    )
    .await;

    let responses = host.responses_for("inv-chat");
    assert_eq!(responses.len(), 2, "unexpected responses: {responses:?}");
    assert_eq!(
        responses[0].log,
        Some(json!({
            "prompt": "explain this",
            "search_path_head": host.extensions_dir.display().to_string(),
        }))
    );
    assert!(!responses[0].is_stopped);
    assert!(responses[1].is_stopped);
    assert!(responses[1].error.is_none());
    assert!(host.router.active_invocations().is_empty());
}

#[tokio::test]
async fn integration_python_on_demand_default_entry_point_failure_is_terminal_error() {
    if !python3_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    let host = start_python_host().await;

    host.run_to_completion(InvocationRequest::new("inv-apply", ExtensionKind::Apply))
        .await;

    let responses = host.responses_for("inv-apply");
    assert_eq!(responses.len(), 1, "unexpected responses: {responses:?}");
    assert!(responses[0].is_stopped);
    let message = responses[0].error_message().expect("error text");
    assert!(message.starts_with("Traceback"), "{message}");
    assert!(message.contains("ValueError: bad patch inv-apply"), "{message}");
}

#[tokio::test]
async fn integration_python_persistent_failure_posts_error_and_worker_survives() {
    if !python3_available() {
        eprintln!("python3 not found; skipping");
        return;
    }
    let host = start_python_host().await;

    host.run_to_completion(InvocationRequest::new("inv-a1", ExtensionKind::Autocomplete))
        .await;
    let first = host.responses_for("inv-a1");
    assert_eq!(first.len(), 1, "unexpected responses: {first:?}");
    assert!(first[0].is_stopped);
    assert!(first[0]
        .error_message()
        .is_some_and(|message| message.contains("RuntimeError: boom inv-a1")));
    let pid = host
        .router
        .persistent()
        .worker_pid(ExtensionKind::Autocomplete)
        .expect("persistent worker still running");

    host.run_to_completion(InvocationRequest::new("inv-a2", ExtensionKind::Autocomplete))
        .await;
    let second = host.responses_for("inv-a2");
    assert_eq!(second.len(), 1, "unexpected responses: {second:?}");
    assert!(second[0]
        .error_message()
        .is_some_and(|message| message.contains("RuntimeError: boom inv-a2")));
    assert_eq!(
        host.router
            .persistent()
            .worker_pid(ExtensionKind::Autocomplete),
        Some(pid)
    );
    host.router.shutdown().await;
}
