//! Query routing
//!
//! The router turns a [`Query`] into an ordered [`InvocationPlan`] and decides,
//! once retrieval has answered, whether the conditional web search runs. Both
//! decisions are pure functions of the query, the early signals and the
//! configuration snapshot.

use crate::types::{Query, SourceKind, SourceSignal};
use crate::utils::toml_config::RouterConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One stage of an invocation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", content = "sources", rename_all = "snake_case")]
pub enum PlanStep {
    /// Independent gateways invoked together and joined at a barrier
    Concurrent(Vec<SourceKind>),
    /// Web search, decided after retrieval has returned
    WebSearchIfNeeded,
    Generate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationPlan {
    steps: Vec<PlanStep>,
}

impl InvocationPlan {
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Every source kind the plan may invoke, in plan order.
    pub fn planned_kinds(&self) -> Vec<SourceKind> {
        let mut kinds = Vec::new();
        for step in &self.steps {
            match step {
                PlanStep::Concurrent(batch) => kinds.extend(batch.iter().copied()),
                PlanStep::WebSearchIfNeeded => kinds.push(SourceKind::WebSearch),
                PlanStep::Generate => kinds.push(SourceKind::Generation),
            }
        }
        kinds
    }

    pub fn may_invoke(&self, kind: SourceKind) -> bool {
        self.planned_kinds().contains(&kind)
    }
}

/// Why the conditional web search was run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum WebSearchTrigger {
    RetrievalFailed,
    NoRetrievalResults,
    LowRetrievalScore { best: f64 },
    TemporalMarker { marker: String },
    TemporalHint,
}

impl fmt::Display for WebSearchTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebSearchTrigger::RetrievalFailed => f.write_str("retrieval failed"),
            WebSearchTrigger::NoRetrievalResults => f.write_str("retrieval returned no results"),
            WebSearchTrigger::LowRetrievalScore { best } => {
                write!(f, "best retrieval score {:.3} below threshold", best)
            }
            WebSearchTrigger::TemporalMarker { marker } => {
                write!(f, "temporal marker '{}' in query", marker)
            }
            WebSearchTrigger::TemporalHint => f.write_str("caller requested recent information"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRouter {
    config: RouterConfig,
}

impl QueryRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Build the invocation plan for a query.
    ///
    /// Vision is always listed first when an image is present. Retrieval runs
    /// for every text query, alongside vision or after it when
    /// `vision_gates_retrieval` is set. Generation always closes the plan.
    pub fn plan(&self, query: &Query) -> InvocationPlan {
        let mut steps = Vec::new();

        match (query.has_image(), query.has_text()) {
            (true, true) if self.config.vision_gates_retrieval => {
                steps.push(PlanStep::Concurrent(vec![SourceKind::Vision]));
                steps.push(PlanStep::Concurrent(vec![SourceKind::Retrieval]));
            }
            (true, true) => {
                steps.push(PlanStep::Concurrent(vec![
                    SourceKind::Vision,
                    SourceKind::Retrieval,
                ]));
            }
            (true, false) => steps.push(PlanStep::Concurrent(vec![SourceKind::Vision])),
            (false, true) => steps.push(PlanStep::Concurrent(vec![SourceKind::Retrieval])),
            (false, false) => {}
        }

        if query.has_text() && self.config.web_search_enabled {
            steps.push(PlanStep::WebSearchIfNeeded);
        }

        steps.push(PlanStep::Generate);

        InvocationPlan { steps }
    }

    /// Decide whether the conditional web search runs.
    ///
    /// `retrieval` is the retrieval signal if one arrived. The first matching
    /// trigger is reported.
    pub fn web_search_trigger(
        &self,
        query: &Query,
        retrieval: Option<&SourceSignal>,
    ) -> Option<WebSearchTrigger> {
        if !self.config.web_search_enabled {
            return None;
        }
        let text = query.text()?;

        let retrieval_trigger = match retrieval {
            None => Some(WebSearchTrigger::RetrievalFailed),
            Some(signal) if !signal.succeeded() => Some(WebSearchTrigger::RetrievalFailed),
            Some(signal) => match signal.passages() {
                None | Some([]) => Some(WebSearchTrigger::NoRetrievalResults),
                Some(passages) => {
                    let best = passages
                        .iter()
                        .map(|p| p.score)
                        .fold(f64::NEG_INFINITY, f64::max);
                    if best < self.config.web_search_threshold {
                        Some(WebSearchTrigger::LowRetrievalScore { best })
                    } else {
                        None
                    }
                }
            },
        };

        retrieval_trigger
            .or_else(|| {
                self.temporal_marker(text)
                    .map(|marker| WebSearchTrigger::TemporalMarker { marker })
            })
            .or_else(|| query.temporal_hint().then_some(WebSearchTrigger::TemporalHint))
    }

    /// First whole-word temporal marker in `text`, case-insensitive.
    pub fn temporal_marker(&self, text: &str) -> Option<String> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();
        if tokens.is_empty() {
            return None;
        }
        let padded = format!(" {} ", tokens.join(" "));

        for keyword in &self.config.temporal_keywords {
            let keyword = keyword
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(|t| t.to_lowercase())
                .collect::<Vec<_>>()
                .join(" ");
            if !keyword.is_empty() && padded.contains(&format!(" {} ", keyword)) {
                return Some(keyword);
            }
        }

        let floor = self.config.recent_year_floor?;
        tokens
            .into_iter()
            .find(|t| {
                t.len() == 4
                    && t.chars().all(|c| c.is_ascii_digit())
                    && t.parse::<u16>().is_ok_and(|year| year >= floor)
            })
    }
}
