//! NDJSON stdio transport between the host application and the router.

use anyhow::{Context, Result};
use pylon_protocol::{InvocationRequest, Response};
use pylon_runtime::{DeliverFn, DispatchRouter};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub(crate) struct HostServeReport {
    pub(crate) processed_lines: usize,
    pub(crate) error_count: usize,
    /// Execution tasks still tracked when input ended.
    pub(crate) pending: Vec<JoinHandle<()>>,
}

/// Reads requests until EOF. Malformed lines are answered with a terminal
/// error when their `invocation_id` can be recovered and no invocation with
/// that id is running; otherwise they are skipped.
pub(crate) async fn read_invocation_requests<R>(
    reader: R,
    router: &DispatchRouter,
    sink: &DeliverFn,
) -> Result<HostServeReport>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut report = HostServeReport::default();

    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read invocation request line")?
    {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        report.processed_lines = report.processed_lines.saturating_add(1);
        match serde_json::from_str::<InvocationRequest>(trimmed) {
            Ok(request) => {
                if let Some(handle) = router.on_receive(request) {
                    report.pending.retain(|pending| !pending.is_finished());
                    report.pending.push(handle);
                }
            }
            Err(error) => {
                report.error_count = report.error_count.saturating_add(1);
                let invocation_id = InvocationRequest::recover_invocation_id(trimmed);
                warn!(
                    invocation_id = invocation_id.as_deref().unwrap_or("unknown"),
                    error = %error,
                    "invalid invocation request"
                );
                match invocation_id {
                    // The live channel owns the terminal response for this id.
                    Some(invocation_id) if router.get_channel(&invocation_id).is_some() => {
                        debug!(%invocation_id, "invalid request for active invocation rejected");
                    }
                    Some(invocation_id) => {
                        let mut response =
                            Response::error(format!("invalid invocation request: {error}"));
                        response.invocation_id = invocation_id;
                        sink(response);
                    }
                    None => {}
                }
            }
        }
    }
    report.pending.retain(|pending| !pending.is_finished());
    Ok(report)
}

/// Streams responses as NDJSON until every sender is dropped.
pub(crate) async fn write_responses<W>(
    mut responses: UnboundedReceiver<Response>,
    mut writer: W,
) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0_usize;
    while let Some(response) = responses.recv().await {
        let mut line =
            serde_json::to_string(&response).context("failed to serialize response frame")?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("failed to write response frame")?;
        writer
            .flush()
            .await
            .context("failed to flush response frame")?;
        written = written.saturating_add(1);
        debug!(invocation_id = %response.invocation_id, is_stopped = response.is_stopped, "response written");
    }
    Ok(written)
}
