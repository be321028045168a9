//! Request lifecycle state machine

use crate::types::{AppError, RequestId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Lifecycle states of one request.
///
/// `Created -> Routing -> Gathering -> Fusing -> (Escalated | Completed) ->
/// Terminal`, with `Failed` reachable from `Gathering` when no source
/// succeeds. Single pass; nothing re-enters `Gathering`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Created,
    Routing,
    Gathering,
    Fusing,
    Escalated,
    Completed,
    Failed,
    Terminal,
}

impl RequestState {
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Created, Routing)
                | (Routing, Gathering)
                | (Gathering, Fusing)
                | (Gathering, Failed)
                | (Fusing, Escalated)
                | (Fusing, Completed)
                | (Escalated, Terminal)
                | (Completed, Terminal)
        )
    }

    /// `Failed` and `Terminal` end the lifecycle.
    pub fn is_final(&self) -> bool {
        matches!(self, RequestState::Failed | RequestState::Terminal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Created => "created",
            RequestState::Routing => "routing",
            RequestState::Gathering => "gathering",
            RequestState::Fusing => "fusing",
            RequestState::Escalated => "escalated",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
            RequestState::Terminal => "terminal",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one request plus every state it has passed through.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    request_id: RequestId,
    state: RequestState,
    trace: Vec<RequestState>,
}

impl Lifecycle {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            state: RequestState::Created,
            trace: vec![RequestState::Created],
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn trace(&self) -> &[RequestState] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<RequestState> {
        self.trace
    }

    /// Move to `next`. An illegal move is a bug in the engine, not in the
    /// caller's input, so it surfaces as `Internal`.
    pub fn advance(&mut self, next: RequestState) -> Result<(), AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::Internal(format!(
                "illegal request state transition {} -> {} for {}",
                self.state, next, self.request_id
            )));
        }
        debug!(request_id = %self.request_id, from = %self.state, to = %next, "Request state");
        self.state = next;
        self.trace.push(next);
        Ok(())
    }
}
