//! HTTP surface.
//!
//! Every path except `/healthz` renders the verification page through the
//! [`RenderController`]. A rejected render is answered with a plain-text
//! 500 fallback; no CSP is attached because no page is served.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{HeaderValue, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tracing::{error, info};

use crate::config::NonceshellConfig;
use crate::controller::{RenderController, StreamingResponse};
use crate::document::{route_headers, DocumentEngine};
use crate::engine::{RenderEngine, RenderRequest};

/// Shared state for request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    controller: RenderController,
    route_headers: HeaderMap,
}

impl AppState {
    /// State over an arbitrary engine.
    pub fn new(controller: RenderController, route_headers: HeaderMap) -> Self {
        Self {
            controller,
            route_headers,
        }
    }

    /// State rendering the verification page as configured.
    pub fn from_config(config: &NonceshellConfig) -> Self {
        let document = config.document_options();
        let headers = route_headers(&document);
        let engine: Arc<dyn RenderEngine> = Arc::new(DocumentEngine::new(document));
        Self::new(
            RenderController::new(engine, config.controller_options()),
            headers,
        )
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .fallback(render_page)
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(config: &NonceshellConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen))?;
    let addr = listener.local_addr()?;
    info!(%addr, "nonceshell listening");

    axum::serve(listener, router(AppState::from_config(config)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("nonceshell stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn render_page(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request = RenderRequest {
        method,
        uri,
        headers,
    };
    match state
        .controller
        .handle(request, StatusCode::OK, state.route_headers.clone())
        .await
    {
        Ok(response) => into_response(response),
        Err(e) => {
            error!(error = %e, "render rejected, sending fallback");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                "render failed",
            )
                .into_response()
        }
    }
}

/// Convert a committed response into an axum response with a streamed body.
pub fn into_response(response: StreamingResponse) -> Response {
    let (status, headers, body, _completion) = response.into_parts();
    let mut out = Response::new(Body::from_stream(body.map(Ok::<_, Infallible>)));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}
