use std::future::Future;

use anyhow::{Context, Result};
use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    Router,
};
use tracing::info;

/// Liveness probe: every path and method gets `200 OK`.
async fn ok() -> impl IntoResponse {
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], "OK")
}

pub fn router() -> Router {
    Router::new().fallback(ok)
}

/// Serve the health endpoint on all interfaces until `shutdown` resolves.
pub async fn serve<F>(port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health server to {addr}"))?;

    info!("Health server listening on {}", addr);

    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown)
        .await
        .context("Health server error")
}
