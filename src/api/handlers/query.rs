//! Query submission handler

use crate::{
    orchestrator::{QueryOutcome, SubmitOptions},
    types::{AppError, QueryRequest, Result},
    AppState,
};
use axum::{extract::State, Json};
use tokio_util::sync::CancellationToken;

/// Submit a query and wait for the fused answer.
///
/// Malformed queries are rejected with 400 before any gateway is called. If
/// the client disconnects, axum drops this future and the guard cancels the
/// in-flight gateway calls.
pub async fn submit_query(
    State(state): State<AppState>,
    Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryOutcome>> {
    let (query, request_id) = payload.into_query()?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let result = state
        .orchestrator
        .submit(
            query,
            SubmitOptions {
                request_id,
                cancel: Some(cancel),
            },
        )
        .await;

    match &result {
        Ok(outcome) if outcome.escalated => state
            .metrics
            .record_escalation(outcome.confidence_profile.level),
        Err(AppError::FusionImpossible { .. }) => state.metrics.record_fusion_failure(),
        _ => {}
    }

    Ok(Json(result?))
}
