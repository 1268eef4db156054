//! Metrics HTTP server.

use axum::{extract::State, routing::get, Json, Router};
use thiserror::Error;
use tracing::info;

use crate::metrics::{MetricsSnapshot, SharedMetrics};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind metrics server: {0}")]
    BindError(#[from] std::io::Error),
}

/// GET /metrics
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().await.clone();
    Json(snapshot)
}

pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Serve the metrics router on `addr` until the process exits.
pub async fn run_metrics_server(metrics: SharedMetrics, addr: &str) -> Result<(), ServerError> {
    let app = create_metrics_router(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "metrics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
