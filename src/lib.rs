//! # Triangulate - multimodal evidence triangulation server
//!
//! Answers a query (text, an image, or both) by consulting several independent
//! sources, an image classifier, a retrieval index, a web-search fallback and
//! a language model, and returns one answer whose trustworthiness is
//! explicitly quantified. Low-confidence or contradictory answers are parked
//! in a durable queue for human review instead of being returned as fact.
//!
//! ## Overview
//!
//! Triangulate can be used in two ways:
//!
//! 1. **As a standalone server** - Run the `triangulate-server` binary
//! 2. **As a library** - Embed the [`Orchestrator`] with your own gateways
//!
//! ### Library Example
//!
//! ```rust,ignore
//! use triangulate::{
//!     ConfigManager, Gateways, InMemoryEscalationQueue, Orchestrator, Query, SubmitOptions,
//!     TriangulateConfig,
//! };
//! use std::sync::Arc;
//!
//! let config_manager = Arc::new(ConfigManager::from_config(TriangulateConfig::default()));
//! let gateways = Gateways::builder()
//!     .retrieval(Arc::new(my_index))
//!     .generation(Arc::new(my_llm))
//!     .build();
//! let orchestrator = Orchestrator::new(
//!     config_manager,
//!     gateways,
//!     Arc::new(InMemoryEscalationQueue::new()),
//! );
//!
//! let outcome = orchestrator
//!     .submit(Query::text_only("what does consolidation indicate")?, SubmitOptions::default())
//!     .await?;
//! println!("{} ({})", outcome.confidence_profile.overall, outcome.confidence_profile.level);
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `ollama` | Ollama generation backend (default) |
//!
//! ## Modules
//!
//! - [`orchestrator`] - Request lifecycle state machine
//! - [`router`] - Invocation planning and the conditional web search
//! - [`gateways`] - Source adapters with timeout and retry
//! - [`confidence`] - Confidence fusion
//! - [`merge`] - Narrative merging and contradiction detection
//! - [`escalation`] - Human-review queue
//! - [`metrics`] - Prometheus request and outcome metrics
//! - [`api`] - REST API handlers and routes
//! - [`types`] - Common types and error handling

/// HTTP API handlers and routes.
pub mod api;
/// Operator command line.
pub mod cli;
/// Confidence fusion.
pub mod confidence;
/// Human-review escalation queue.
pub mod escalation;
/// Source gateways and their backends.
pub mod gateways;
/// Generation backends.
pub mod llm;
/// Narrative merging and contradiction detection.
pub mod merge;
/// Prometheus metrics.
pub mod metrics;
/// Request orchestration.
pub mod orchestrator;
/// Invocation planning.
pub mod router;
/// Core types (queries, signals, errors).
pub mod types;
/// Configuration utilities.
pub mod utils;

// Re-export commonly used types
pub use confidence::{ConfidenceBuilder, ConfidenceLevel, ConfidenceProfile};
pub use escalation::{
    EscalationItem, EscalationQueue, EscalationStatus, FileEscalationQueue,
    InMemoryEscalationQueue,
};
pub use gateways::{Gateways, GatewaysBuilder};
pub use merge::{MergedResult, Merger};
pub use metrics::ApiMetrics;
pub use orchestrator::{Orchestrator, QueryOutcome, SubmitOptions};
pub use router::QueryRouter;
pub use types::{AppError, Query, Result};
pub use utils::toml_config::{ConfigManager, TriangulateConfig};

use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// TOML configuration with hot-reload support
    pub config_manager: Arc<ConfigManager>,
    /// Request engine
    pub orchestrator: Arc<Orchestrator>,
    /// Escalation store, shared with the orchestrator
    pub escalations: Arc<dyn EscalationQueue>,
    /// Prometheus registry served at `/metrics`
    pub metrics: Arc<ApiMetrics>,
}

impl AppState {
    pub fn new(
        config_manager: Arc<ConfigManager>,
        orchestrator: Arc<Orchestrator>,
        metrics: Arc<ApiMetrics>,
    ) -> Self {
        let escalations = Arc::clone(orchestrator.queue());
        Self {
            config_manager,
            orchestrator,
            escalations,
            metrics,
        }
    }
}
