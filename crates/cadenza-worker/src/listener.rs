// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound HTTP listener for messages pushed by the proxy.
//!
//! The proxy POSTs encoded messages to `/`. Each accepted message is handed to
//! the [`Dispatcher`] and acknowledged at once; its reply travels back as a
//! separate outbound request.

use std::net::SocketAddr;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::any,
};
use cadenza_protocol::{CONTENT_TYPE, codec};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{Result, WorkerError};

fn plain(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        message.into(),
    )
        .into_response()
}

/// Routes for the listener.
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/", any(receive))
        .fallback(not_found)
        .with_state(dispatcher)
}

/// Bind `addr` and serve until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, dispatcher: Dispatcher, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!(%addr, error = %e, "Failed to bind listener");
        WorkerError::Transport(format!("failed to bind {addr}: {e}"))
    })?;
    serve_on(listener, dispatcher, shutdown).await
}

/// Serve on an already bound listener until `shutdown` is cancelled.
pub async fn serve_on(
    listener: TcpListener,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| WorkerError::Transport(format!("listener has no address: {e}")))?;
    info!(%addr, client_id = dispatcher.client_id(), "Listening for proxy messages");

    axum::serve(listener, router(dispatcher))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| WorkerError::Transport(format!("listener failed: {e}")))?;

    info!(%addr, "Listener stopped");
    Ok(())
}

async fn receive(
    State(dispatcher): State<Dispatcher>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return plain(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("[{method}] not supported, use POST"),
        );
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if content_type != CONTENT_TYPE {
        return plain(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("content type [{content_type}] not supported, expected [{CONTENT_TYPE}]"),
        );
    }

    let message = match codec::decode(body) {
        Ok(message) => message,
        Err(err) => {
            warn!(error = %err, "Undecodable message from proxy");
            return plain(StatusCode::BAD_REQUEST, format!("invalid message: {err}"));
        }
    };

    debug!(message_type = %message.message_type(), request_id = message.request_id(), "Received message");
    dispatcher.dispatch(message);
    StatusCode::OK.into_response()
}

async fn not_found(method: Method, uri: axum::http::Uri) -> Response {
    plain(
        StatusCode::NOT_FOUND,
        format!("[{method} {}] not found", uri.path()),
    )
}
