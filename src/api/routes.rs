use crate::api::handlers::{escalations, health, metrics, query};
use crate::metrics::track_requests;
use crate::AppState;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};

/// Routes mounted under `/api`.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/query", post(query::submit_query))
        .route("/escalations", get(escalations::list_escalations))
        .route("/escalations/stats", get(escalations::escalation_stats))
        .route("/escalations/{id}", get(escalations::get_escalation))
        .route(
            "/escalations/{id}/transition",
            post(escalations::transition_escalation),
        )
}

/// The full application without transport layers.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_export))
        .nest("/api", create_router())
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}
