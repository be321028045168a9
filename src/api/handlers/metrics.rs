use crate::{types::AppError, AppState};
use axum::{extract::State, http::header, response::IntoResponse};

/// Prometheus scrape endpoint.
pub async fn metrics_export(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state
        .metrics
        .export()
        .map_err(|e| AppError::Internal(format!("failed to encode metrics: {}", e)))?;
    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body))
}
