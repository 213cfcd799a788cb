//! HTTP callback endpoint: `POST /invocations/{ignored}`.
//!
//! Each call carries `{method, ...fields, meta: {invocation_id, request_id}}`.
//! The method is mapped onto exactly one response field and delivered to the
//! channel registered for `meta.invocation_id`. Rejections never touch other
//! channels.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use pylon_protocol::{parse_callback_payload, CallbackError};
use pylon_runtime::DispatchRouter;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

mod types;

pub use types::{CallbackAck, CallbackEndpointError, CallbackStatusReport};

/// The path segment is ignored; routing uses `meta.invocation_id`.
pub const CALLBACK_INVOCATIONS_ENDPOINT: &str = "/invocations/{ignored}";
pub const CALLBACK_STATUS_ENDPOINT: &str = "/status";

pub async fn bind_callback_listener(host: &str, port: u16) -> Result<TcpListener> {
    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind callback endpoint on {host}:{port}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound callback endpoint address")?;
    info!(addr = %local_addr, "callback endpoint bound");
    Ok(listener)
}

pub fn build_callback_endpoint_router(router: Arc<DispatchRouter>) -> Router {
    Router::new()
        .route(CALLBACK_INVOCATIONS_ENDPOINT, post(handle_invocation_callback))
        .route(CALLBACK_STATUS_ENDPOINT, get(handle_callback_status))
        .with_state(router)
}

/// Serves until `shutdown` resolves.
pub async fn serve_callback_endpoint<F>(
    listener: TcpListener,
    router: Arc<DispatchRouter>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr: Option<SocketAddr> = listener.local_addr().ok();
    let app = build_callback_endpoint_router(router);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("callback endpoint exited unexpectedly")?;
    info!(addr = ?local_addr, "callback endpoint stopped");
    Ok(())
}

/// Validates, normalizes, and delivers one raw callback body.
pub fn accept_callback(
    router: &DispatchRouter,
    raw: &[u8],
) -> Result<CallbackAck, CallbackEndpointError> {
    let payload = parse_callback_payload(raw)
        .map_err(|error| CallbackEndpointError::invalid_payload(error.to_string()))?;
    let invocation_id = payload.meta.invocation_id.trim().to_string();
    if invocation_id.is_empty() {
        return Err(CallbackEndpointError::invalid_payload(
            CallbackError::MissingInvocationId.to_string(),
        ));
    }
    let channel = router
        .get_channel(&invocation_id)
        .ok_or_else(|| CallbackEndpointError::channel_not_found(&invocation_id))?;

    let normalized = payload.normalize().map_err(|error| match error {
        CallbackError::UnknownMethod(_) => CallbackEndpointError::unknown_method(error.to_string()),
        other => CallbackEndpointError::invalid_payload(other.to_string()),
    })?;
    let delivered = channel.deliver(normalized.response, normalized.request_id.as_deref());
    debug!(
        %invocation_id,
        field = normalized.field.as_str(),
        delivered,
        "callback accepted"
    );
    Ok(CallbackAck::accepted(delivered))
}

async fn handle_invocation_callback(
    State(router): State<Arc<DispatchRouter>>,
    body: Bytes,
) -> Response {
    match accept_callback(&router, &body) {
        Ok(ack) => Json(ack).into_response(),
        Err(error) => {
            warn!(code = error.code, message = %error.message, "callback rejected");
            error.into_response()
        }
    }
}

async fn handle_callback_status(State(router): State<Arc<DispatchRouter>>) -> Response {
    Json(CallbackStatusReport {
        active_invocations: router.active_invocations(),
        workers: router.persistent().snapshots(),
    })
    .into_response()
}
