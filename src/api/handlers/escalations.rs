//! Escalation review handlers
//!
//! Read and advance items in the human-review queue. Items are never deleted;
//! reviewers move them forward with `transition`.

use crate::{
    escalation::{EscalationItem, EscalationStatus, QueueStats},
    types::{EscalationId, Result},
    AppState,
};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// pending, in_review or resolved
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EscalationList {
    pub escalations: Vec<EscalationItem>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub status: String,
    #[serde(default)]
    pub reviewer_note: Option<String>,
}

pub async fn list_escalations(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<EscalationList>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<EscalationStatus>)
        .transpose()?;

    let escalations = state.escalations.list(status).await?;
    Ok(Json(EscalationList {
        total: escalations.len(),
        escalations,
    }))
}

pub async fn get_escalation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EscalationItem>> {
    let id: EscalationId = id.parse()?;
    Ok(Json(state.escalations.get(id).await?))
}

/// Move an item one step forward. Skipping `in_review` or moving backwards
/// is a 409.
pub async fn transition_escalation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<TransitionRequest>,
) -> Result<Json<EscalationItem>> {
    let id: EscalationId = id.parse()?;
    let status: EscalationStatus = payload.status.parse()?;
    let note = payload
        .reviewer_note
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    Ok(Json(state.escalations.transition(id, status, note).await?))
}

pub async fn escalation_stats(State(state): State<AppState>) -> Result<Json<QueueStats>> {
    Ok(Json(state.escalations.stats().await?))
}
