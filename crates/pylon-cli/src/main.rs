mod bootstrap_helpers;
mod cli_args;
mod host_transport;
mod watchers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pylon_gateway::{bind_callback_listener, serve_callback_endpoint};
use pylon_protocol::Response;
use pylon_runtime::{DeliverFn, DispatchRouter, RuntimeContext};
use tokio::io::BufReader;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::bootstrap_helpers::{init_tracing, resolve_runtime_config};
use crate::cli_args::Cli;
use crate::host_transport::{read_invocation_requests, write_responses};
use crate::watchers::{ConfigFileWatcher, ExtensionsDirWatcher};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_host(cli).await
}

async fn run_host(cli: Cli) -> Result<()> {
    let overrides = cli.overrides();
    let config = resolve_runtime_config(cli.config.as_deref(), &overrides)?;

    let listener = bind_callback_listener(&config.callback_host, config.callback_port).await?;
    let callback_addr = listener
        .local_addr()
        .context("failed to resolve callback endpoint address")?;
    let extensions_dir = config.extensions_dir.clone();
    let context = Arc::new(RuntimeContext::new(config, Some(callback_addr)));

    let (response_tx, response_rx) = mpsc::unbounded_channel::<Response>();
    let sink: DeliverFn = Arc::new(move |response| {
        if response_tx.send(response).is_err() {
            warn!("response dropped: host output closed");
        }
    });
    let router = Arc::new(DispatchRouter::new(Arc::clone(&context), Arc::clone(&sink)));

    let extensions_watcher = if cli.watch_extensions {
        match ExtensionsDirWatcher::start(&extensions_dir) {
            Ok(watcher) => {
                router.persistent().attach(watcher.signals());
                Some(watcher)
            }
            Err(error) => {
                warn!(error = %format!("{error:#}"), "extensions watcher disabled");
                None
            }
        }
    } else {
        None
    };
    let config_watcher = match (&cli.config, cli.watch_config) {
        (Some(path), true) => {
            let watcher = ConfigFileWatcher::start(path, overrides.clone(), Arc::clone(&context))?;
            router.persistent().attach(watcher.signals());
            Some(watcher)
        }
        _ => None,
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve_callback_endpoint(
        listener,
        Arc::clone(&router),
        async move {
            let _ = shutdown_rx.await;
        },
    ));
    let writer = tokio::spawn(write_responses(response_rx, tokio::io::stdout()));
    info!(callback_addr = %callback_addr, "pylon host ready");

    let stdin = BufReader::new(tokio::io::stdin());
    let pending = tokio::select! {
        report = read_invocation_requests(stdin, &router, &sink) => {
            let report = report?;
            info!(
                processed_lines = report.processed_lines,
                error_count = report.error_count,
                "host input closed"
            );
            report.pending
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            Vec::new()
        }
    };

    router.shutdown().await;
    let grace = context.config().kill_grace() * 2;
    for task in pending {
        if tokio::time::timeout(grace, task).await.is_err() {
            warn!("invocation task still running after shutdown grace");
        }
    }
    drop(extensions_watcher);
    drop(config_watcher);

    let _ = shutdown_tx.send(());
    match server.await {
        Ok(result) => result?,
        Err(error) => warn!(error = %error, "callback endpoint task failed"),
    }

    // The writer drains once every sink clone is gone.
    drop(sink);
    drop(router);
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
        Ok(Ok(result)) => {
            let written = result?;
            info!(written, "host output drained");
        }
        Ok(Err(error)) => warn!(error = %error, "response writer task failed"),
        Err(_) => warn!("response writer did not drain in time"),
    }
    Ok(())
}
