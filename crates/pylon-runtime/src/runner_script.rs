//! Generated adapter scripts that load an extension module inside a worker.
//!
//! Each script is written once per process spawn and removed when that
//! process exits. Module coordinates are embedded as JSON string literals,
//! which the worker interpreter reads as plain string constants.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::supervisor::absolutize;

/// Line written to a persistent worker's stdin before each request line.
pub const PROCESS_REQUEST_SENTINEL: &str = "PROCESS_REQUEST";
/// Entry point used when an extension's settings do not name one.
pub const DEFAULT_ENTRY_POINT: &str = "extension";
pub const EXTENSION_UUID_ENV: &str = "EXTENSION_UUID";
pub const CALLBACK_HOST_ENV: &str = "HOST";
pub const CALLBACK_PORT_ENV: &str = "PORT";

const ON_DEMAND_SCRIPT_PREFIX: &str = "pylon-on-demand-";
const PERSISTENT_SCRIPT_PREFIX: &str = "pylon-persistent-";
const MODULE_DIR_PLACEHOLDER: &str = "__PYLON_MODULE_DIR__";
const MODULE_NAME_PLACEHOLDER: &str = "__PYLON_MODULE_NAME__";

const ON_DEMAND_TEMPLATE: &str = r#"import importlib
import json
import sys

MODULE_DIR = __PYLON_MODULE_DIR__
MODULE_NAME = __PYLON_MODULE_NAME__

sys.path.insert(0, MODULE_DIR)
module = importlib.import_module(MODULE_NAME)
try:
    settings = importlib.import_module(MODULE_NAME + ".settings")
except ImportError:
    settings = module
entry_point = getattr(module, getattr(settings, "ENTRY_POINT", "extension"))

raw = sys.stdin.readline()
payload = json.loads(raw) if raw.strip() else {}
sys.stdin.close()
entry_point(payload)
"#;

const PERSISTENT_TEMPLATE: &str = r#"import importlib
import json
import os
import sys
import threading
import traceback
import urllib.request

MODULE_DIR = __PYLON_MODULE_DIR__
MODULE_NAME = __PYLON_MODULE_NAME__
SENTINEL = "PROCESS_REQUEST"

HOST = os.environ["HOST"]
PORT = os.environ["PORT"]
EXTENSION_UUID = os.environ.get("EXTENSION_UUID", "")
OPENER = urllib.request.build_opener(urllib.request.ProxyHandler({}))


def post_error(message, invocation_id, request_id=None):
    host = "[%s]" % HOST if ":" in HOST else HOST
    body = json.dumps(
        {
            "method": "error",
            "content": message,
            "meta": {"invocation_id": invocation_id, "request_id": request_id},
        }
    ).encode("utf-8")
    request = urllib.request.Request(
        "http://%s:%s/invocations/%s" % (host, PORT, invocation_id),
        data=body,
        headers={"Content-Type": "application/json"},
        method="POST",
    )
    try:
        OPENER.open(request, timeout=5).read()
    except Exception:
        traceback.print_exc(file=sys.stderr)


sys.path.insert(0, MODULE_DIR)
module = importlib.import_module(MODULE_NAME)
try:
    settings = importlib.import_module(MODULE_NAME + ".settings")
except ImportError:
    settings = module
entry_point = getattr(module, getattr(settings, "ENTRY_POINT", "extension"))


def run(payload):
    try:
        entry_point(payload)
    except Exception:
        post_error(
            traceback.format_exc(),
            payload.get("invocation_id", EXTENSION_UUID),
            payload.get("request_id"),
        )


while True:
    line = sys.stdin.readline()
    if not line:
        break
    if line.strip() != SENTINEL:
        continue
    raw = sys.stdin.readline()
    if not raw:
        break
    try:
        payload = json.loads(raw)
    except ValueError as error:
        post_error("invalid request line: %s" % error, EXTENSION_UUID)
        continue
    threading.Thread(target=run, args=(payload,), daemon=True).start()
"#;

/// Materializes adapter scripts and worker environments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerScriptBuilder {
    scripts_dir: PathBuf,
    module_search_path_var: String,
}

impl RunnerScriptBuilder {
    pub fn new(scripts_dir: impl Into<PathBuf>, module_search_path_var: &str) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            module_search_path_var: module_search_path_var.to_string(),
        }
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// One-shot adapter: imports the module, reads the request line, and
    /// calls the entry point once with the decoded request. Both adapters
    /// share that calling convention, so a module runs under either
    /// lifecycle.
    pub fn build_on_demand(&self, module_dir: &Path, module_name: &str) -> io::Result<PathBuf> {
        let source = render_template(ON_DEMAND_TEMPLATE, module_dir, module_name)?;
        self.write_script(ON_DEMAND_SCRIPT_PREFIX, &source)
    }

    /// Looping adapter: runs the entry point on a fresh thread for every
    /// sentinel and reports uncaught failures through the callback endpoint.
    pub fn build_persistent(&self, module_dir: &Path, module_name: &str) -> io::Result<PathBuf> {
        let source = render_template(PERSISTENT_TEMPLATE, module_dir, module_name)?;
        self.write_script(PERSISTENT_SCRIPT_PREFIX, &source)
    }

    /// Worker environment. `HOST`/`PORT` are set only when a callback
    /// endpoint is bound; persistent workers require it.
    pub fn build_env(
        &self,
        module_dir: &Path,
        invocation_id: &str,
        callback: Option<SocketAddr>,
    ) -> io::Result<BTreeMap<String, OsString>> {
        let mut search_path = vec![module_dir.to_path_buf()];
        if let Some(existing) = std::env::var_os(&self.module_search_path_var) {
            search_path.extend(std::env::split_paths(&existing));
        }
        let search_path = std::env::join_paths(search_path)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;

        let mut env = BTreeMap::new();
        env.insert(self.module_search_path_var.clone(), search_path);
        env.insert(
            EXTENSION_UUID_ENV.to_string(),
            OsString::from(invocation_id),
        );
        if let Some(addr) = callback {
            env.insert(
                CALLBACK_HOST_ENV.to_string(),
                OsString::from(addr.ip().to_string()),
            );
            env.insert(
                CALLBACK_PORT_ENV.to_string(),
                OsString::from(addr.port().to_string()),
            );
        }
        Ok(env)
    }

    fn write_script(&self, prefix: &str, source: &str) -> io::Result<PathBuf> {
        // Workers run with the module dir as cwd, so the script path must be absolute.
        let scripts_dir = absolutize(&self.scripts_dir);
        std::fs::create_dir_all(&scripts_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".py")
            .tempfile_in(&scripts_dir)?;
        file.write_all(source.as_bytes())?;
        file.flush()?;
        let path = file.into_temp_path().keep().map_err(|error| error.error)?;
        debug!(path = %path.display(), "runner script written");
        Ok(path)
    }
}

fn render_template(template: &str, module_dir: &Path, module_name: &str) -> io::Result<String> {
    let module_dir = module_dir.to_str().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("module dir is not valid UTF-8: {}", module_dir.display()),
        )
    })?;
    let module_dir = serde_json::to_string(module_dir).map_err(io::Error::other)?;
    let module_name = serde_json::to_string(module_name).map_err(io::Error::other)?;
    Ok(template
        .replace(MODULE_DIR_PLACEHOLDER, &module_dir)
        .replace(MODULE_NAME_PLACEHOLDER, &module_name))
}

/// Best-effort cleanup; failures are logged and otherwise ignored.
pub fn remove_runner_script(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "runner script removed"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(
            path = %path.display(),
            error = %error,
            "failed to remove runner script"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        remove_runner_script, RunnerScriptBuilder, CALLBACK_HOST_ENV, CALLBACK_PORT_ENV,
        EXTENSION_UUID_ENV, PROCESS_REQUEST_SENTINEL,
    };

    #[test]
    fn unit_on_demand_script_embeds_module_coordinates_as_literals() {
        let temp = tempdir().expect("tempdir");
        let builder = RunnerScriptBuilder::new(temp.path(), "PYTHONPATH");
        let script = builder
            .build_on_demand(Path::new("/srv/ext \"quoted\""), "chat")
            .expect("build script");

        let source = std::fs::read_to_string(&script).expect("read script");
        assert!(source.contains(r#"MODULE_DIR = "/srv/ext \"quoted\"""#));
        assert!(source.contains(r#"MODULE_NAME = "chat""#));
        assert!(source.contains("\"ENTRY_POINT\", \"extension\""));
        assert!(!source.contains(PROCESS_REQUEST_SENTINEL));
        assert!(source.contains("entry_point(payload)"));
        assert!(script
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("pylon-on-demand-") && name.ends_with(".py")));
    }

    #[test]
    fn unit_persistent_script_loops_on_sentinel_and_posts_errors() {
        let temp = tempdir().expect("tempdir");
        let builder = RunnerScriptBuilder::new(temp.path().join("scripts"), "PYTHONPATH");
        let script = builder
            .build_persistent(Path::new("/srv/ext"), "autocomplete")
            .expect("build script");

        let source = std::fs::read_to_string(&script).expect("read script");
        assert!(source.contains("SENTINEL = \"PROCESS_REQUEST\""));
        assert!(source.contains("os.environ[\"HOST\"]"));
        assert!(source.contains("\"method\": \"error\""));
        assert!(source.contains("threading.Thread"));
        assert!(source.contains("entry_point(payload)"));
    }

    #[test]
    fn functional_build_env_prepends_module_dir_and_scopes_callback_vars() {
        let builder = RunnerScriptBuilder::new(std::env::temp_dir(), "PYLON_TEST_SEARCH_PATH");
        let addr: SocketAddr = "127.0.0.1:4312".parse().expect("addr");

        let on_demand = builder
            .build_env(Path::new("/srv/ext"), "inv-1", None)
            .expect("on-demand env");
        assert_eq!(
            on_demand.get("PYLON_TEST_SEARCH_PATH").and_then(|v| v.to_str()),
            Some("/srv/ext")
        );
        assert_eq!(
            on_demand.get(EXTENSION_UUID_ENV).and_then(|v| v.to_str()),
            Some("inv-1")
        );
        assert!(!on_demand.contains_key(CALLBACK_HOST_ENV));
        assert!(!on_demand.contains_key(CALLBACK_PORT_ENV));

        let persistent = builder
            .build_env(Path::new("/srv/ext"), "inv-2", Some(addr))
            .expect("persistent env");
        assert_eq!(
            persistent.get(CALLBACK_HOST_ENV).and_then(|v| v.to_str()),
            Some("127.0.0.1")
        );
        assert_eq!(
            persistent.get(CALLBACK_PORT_ENV).and_then(|v| v.to_str()),
            Some("4312")
        );
    }

    #[test]
    fn regression_remove_runner_script_tolerates_missing_file() {
        let temp = tempdir().expect("tempdir");
        let builder = RunnerScriptBuilder::new(temp.path(), "PYTHONPATH");
        let script = builder
            .build_on_demand(temp.path(), "apply")
            .expect("build script");
        remove_runner_script(&script);
        assert!(!script.exists());
        remove_runner_script(&script);
    }
}
