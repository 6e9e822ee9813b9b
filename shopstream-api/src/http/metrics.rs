//! Prometheus exposition endpoint

use axum::response::IntoResponse;

use crate::http::error::AppError;

/// `GET /metrics` in Prometheus text format
pub async fn metrics_handler() -> Result<impl IntoResponse, AppError> {
    shopstream_core::metrics::gather_metrics()
        .map_err(|e| AppError::internal_server_error(format!("Failed to encode metrics: {e}")))
}
