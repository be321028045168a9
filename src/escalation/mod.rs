//! Human-review escalation queue
//!
//! Low-confidence or contradictory answers are appended to a durable queue for
//! expert review. Items are never deleted; they move forward through
//! `Pending -> InReview -> Resolved` and keep their full audit trail.
//!
//! Two implementations are provided:
//!
//! - [`FileEscalationQueue`]: one JSON file per item, written atomically
//! - [`InMemoryEscalationQueue`]: process-local, for tests and embedding

pub mod file;
pub mod memory;

pub use file::FileEscalationQueue;
pub use memory::InMemoryEscalationQueue;

use crate::confidence::ConfidenceProfile;
use crate::merge::Contradiction;
use crate::types::{AppError, EscalationId, Query, RequestId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    InReview,
    Resolved,
}

impl EscalationStatus {
    /// The only legal moves are one step forward.
    pub fn can_transition_to(&self, next: EscalationStatus) -> bool {
        matches!(
            (self, next),
            (EscalationStatus::Pending, EscalationStatus::InReview)
                | (EscalationStatus::InReview, EscalationStatus::Resolved)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::InReview => "in_review",
            EscalationStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(EscalationStatus::Pending),
            "in_review" | "inreview" => Ok(EscalationStatus::InReview),
            "resolved" => Ok(EscalationStatus::Resolved),
            other => Err(AppError::InvalidInput(format!(
                "unknown escalation status '{}' (expected pending, in_review or resolved)",
                other
            ))),
        }
    }
}

/// Why a request was routed to human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalationReason {
    LowConfidence { overall: f64 },
    Contradiction { count: usize, overall: f64 },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::LowConfidence { overall } => {
                write!(f, "low confidence ({:.3})", overall)
            }
            EscalationReason::Contradiction { count, overall } => write!(
                f,
                "{} contradiction(s) with confidence {:.3}",
                count, overall
            ),
        }
    }
}

/// A case awaiting, under, or done with human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationItem {
    pub id: EscalationId,
    pub request_id: RequestId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    pub status: EscalationStatus,
    #[serde(default)]
    pub reviewer_note: Option<String>,
    pub query_snapshot: Query,
    pub confidence_profile: ConfidenceProfile,
    #[serde(default)]
    pub reasons: Vec<EscalationReason>,
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
    /// Answer the engine would have given, kept for the reviewer
    #[serde(default)]
    pub draft_answer: Option<String>,
}

impl EscalationItem {
    pub fn new(
        id: EscalationId,
        request_id: RequestId,
        query_snapshot: Query,
        confidence_profile: ConfidenceProfile,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            request_id,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            status: EscalationStatus::Pending,
            reviewer_note: None,
            query_snapshot,
            confidence_profile,
            reasons: Vec::new(),
            contradictions: Vec::new(),
            draft_answer: None,
        }
    }

    pub fn with_reasons(mut self, reasons: Vec<EscalationReason>) -> Self {
        self.reasons = reasons;
        self
    }

    pub fn with_contradictions(mut self, contradictions: Vec<Contradiction>) -> Self {
        self.contradictions = contradictions;
        self
    }

    pub fn with_draft_answer(mut self, draft: Option<String>) -> Self {
        self.draft_answer = draft;
        self
    }

    /// Move to `next`, recording the reviewer note if one is given.
    pub fn apply_transition(
        &mut self,
        next: EscalationStatus,
        note: Option<String>,
    ) -> Result<(), QueueError> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if note.is_some() {
            self.reviewer_note = note;
        }
        if next == EscalationStatus::Resolved {
            self.resolved_at = Some(now);
        }
        Ok(())
    }
}

/// Item counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub in_review: usize,
    pub resolved: usize,
}

impl QueueStats {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a EscalationItem>) -> Self {
        items.into_iter().fold(Self::default(), |mut stats, item| {
            stats.total += 1;
            match item.status {
                EscalationStatus::Pending => stats.pending += 1,
                EscalationStatus::InReview => stats.in_review += 1,
                EscalationStatus::Resolved => stats.resolved += 1,
            }
            stats
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Escalation {0} not found")]
    NotFound(EscalationId),

    #[error("Escalation {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: EscalationId,
        from: EscalationStatus,
        to: EscalationStatus,
    },

    #[error("Escalation store failure: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Persistence(err.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(_) => AppError::NotFound(err.to_string()),
            QueueError::InvalidTransition { .. } => AppError::InvalidTransition(err.to_string()),
            QueueError::Persistence(msg) => AppError::Internal(msg),
        }
    }
}

/// Durable store of escalation items.
///
/// `append` must not return before the item is durable. Appending an id that
/// already exists leaves the stored item untouched and returns the id.
#[async_trait]
pub trait EscalationQueue: Send + Sync {
    async fn append(&self, item: EscalationItem) -> Result<EscalationId, QueueError>;

    /// Items oldest first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<EscalationStatus>,
    ) -> Result<Vec<EscalationItem>, QueueError>;

    async fn get(&self, id: EscalationId) -> Result<EscalationItem, QueueError>;

    async fn transition(
        &self,
        id: EscalationId,
        next: EscalationStatus,
        note: Option<String>,
    ) -> Result<EscalationItem, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let items = self.list(None).await?;
        Ok(QueueStats::from_items(&items))
    }
}
