//! TOML-based configuration for the triangulation engine
//!
//! Every tunable the engine uses (fusion thresholds, router keywords,
//! contradiction settings, gateway endpoints and timeouts, the escalation queue
//! location) is declared in `triangulate.toml`. Every section is optional and
//! falls back to the documented defaults.
//!
//! # Hot Reloading
//!
//! Configuration changes are detected and applied at runtime.
//! Use [`ConfigManager`] for thread-safe access to the current configuration.
//! In-flight requests keep the snapshot they started with.

use crate::types::SourceKind;
use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Root configuration structure loaded from triangulate.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriangulateConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Confidence fusion thresholds and per-source normalization
    #[serde(default)]
    pub confidence: ConfidenceConfig,

    /// Query routing and the web search trigger
    #[serde(default)]
    pub router: RouterConfig,

    /// Fragment ordering and contradiction detection
    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Backend endpoints, timeouts and backoff per source
    #[serde(default)]
    pub gateways: GatewaysConfig,
}

// ============= Server Configuration =============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Allowed CORS origins; empty allows any origin
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Request body limit, sized for base64 images
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_body_bytes() -> usize {
    20 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            cors_origins: Vec::new(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ============= Confidence Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// `overall >= high_threshold` is High
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,

    /// `overall >= medium_threshold` is Medium, anything lower is Low
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,

    /// Number of top retrieval scores averaged into the retrieval component
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    #[serde(default = "default_consensus_count")]
    pub consensus_count: usize,

    #[serde(default = "default_consensus_score")]
    pub consensus_score: f64,

    #[serde(default = "default_consensus_boost")]
    pub consensus_boost: f64,

    #[serde(default = "default_logprob_floor")]
    pub logprob_floor: f64,

    #[serde(default = "default_generation_floor")]
    pub generation_floor: f64,

    #[serde(default = "default_generation_ceiling")]
    pub generation_ceiling: f64,

    /// Generation component used when the backend reports no logprobs
    #[serde(default = "default_missing_logprobs_confidence")]
    pub missing_logprobs_confidence: f64,

    /// Vision findings below this produce a response warning
    #[serde(default = "default_min_vision_confidence")]
    pub min_vision_confidence: f64,

    /// Mean retrieval scores below this produce a response warning
    #[serde(default = "default_low_retrieval_score")]
    pub low_retrieval_score: f64,
}

fn default_high_threshold() -> f64 {
    0.85
}

fn default_medium_threshold() -> f64 {
    0.70
}

fn default_retrieval_top_k() -> usize {
    5
}

fn default_consensus_count() -> usize {
    3
}

fn default_consensus_score() -> f64 {
    0.7
}

fn default_consensus_boost() -> f64 {
    0.10
}

fn default_logprob_floor() -> f64 {
    -5.0
}

fn default_generation_floor() -> f64 {
    0.4
}

fn default_generation_ceiling() -> f64 {
    0.95
}

fn default_missing_logprobs_confidence() -> f64 {
    0.75
}

fn default_min_vision_confidence() -> f64 {
    0.8
}

fn default_low_retrieval_score() -> f64 {
    0.3
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            high_threshold: default_high_threshold(),
            medium_threshold: default_medium_threshold(),
            retrieval_top_k: default_retrieval_top_k(),
            consensus_count: default_consensus_count(),
            consensus_score: default_consensus_score(),
            consensus_boost: default_consensus_boost(),
            logprob_floor: default_logprob_floor(),
            generation_floor: default_generation_floor(),
            generation_ceiling: default_generation_ceiling(),
            missing_logprobs_confidence: default_missing_logprobs_confidence(),
            min_vision_confidence: default_min_vision_confidence(),
            low_retrieval_score: default_low_retrieval_score(),
        }
    }
}

// ============= Router Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_true")]
    pub web_search_enabled: bool,

    /// Best retrieval score below which web search is triggered
    #[serde(default = "default_web_search_threshold")]
    pub web_search_threshold: f64,

    /// Whole-word markers that flag a query as time-sensitive
    #[serde(default = "default_temporal_keywords")]
    pub temporal_keywords: Vec<String>,

    /// Any four-digit year at or above this counts as a temporal marker
    #[serde(default = "default_recent_year_floor")]
    pub recent_year_floor: Option<u16>,

    /// Run retrieval only after the vision finding is available
    #[serde(default)]
    pub vision_gates_retrieval: bool,
}

fn default_true() -> bool {
    true
}

fn default_web_search_threshold() -> f64 {
    0.5
}

fn default_temporal_keywords() -> Vec<String> {
    [
        "latest", "current", "recent", "new", "update", "today", "now", "modern", "2024", "2025",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_recent_year_floor() -> Option<u16> {
    Some(2024)
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            web_search_enabled: true,
            web_search_threshold: default_web_search_threshold(),
            temporal_keywords: default_temporal_keywords(),
            recent_year_floor: default_recent_year_floor(),
            vision_gates_retrieval: false,
        }
    }
}

// ============= Merge Configuration =============

/// A claim subject and, optionally, the word that asserts its negation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTerm {
    pub term: String,
    #[serde(default)]
    pub opposite: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Minimum confidence gap (strict) for a disagreement to count
    #[serde(default = "default_contradiction_delta")]
    pub contradiction_delta: f64,

    /// Subtracted once from the overall score when contradictions exist
    #[serde(default = "default_contradiction_penalty")]
    pub contradiction_penalty: f64,

    #[serde(default = "default_vision_priority_threshold")]
    pub vision_priority_threshold: f64,

    #[serde(default = "default_retrieval_priority_threshold")]
    pub retrieval_priority_threshold: f64,

    /// Confidence attributed to web search when comparing claims
    #[serde(default = "default_web_search_confidence")]
    pub web_search_confidence: f64,

    #[serde(default = "default_claim_terms")]
    pub claim_terms: Vec<ClaimTerm>,

    #[serde(default = "default_negation_cues")]
    pub negation_cues: Vec<String>,

    /// How many tokens before a term a negation cue may appear
    #[serde(default = "default_negation_window")]
    pub negation_window: usize,

    /// Number of top passages or web results scanned for claims
    #[serde(default = "default_claim_passages")]
    pub claim_passages: usize,
}

fn default_contradiction_delta() -> f64 {
    0.4
}

fn default_contradiction_penalty() -> f64 {
    0.15
}

fn default_vision_priority_threshold() -> f64 {
    0.85
}

fn default_retrieval_priority_threshold() -> f64 {
    0.6
}

fn default_web_search_confidence() -> f64 {
    0.7
}

fn default_claim_terms() -> Vec<ClaimTerm> {
    vec![
        ClaimTerm {
            term: "pneumonia".to_string(),
            opposite: Some("normal".to_string()),
        },
        ClaimTerm {
            term: "abnormal".to_string(),
            opposite: Some("normal".to_string()),
        },
    ]
}

fn default_negation_cues() -> Vec<String> {
    [
        "no", "not", "without", "negative", "absent", "ruled", "free", "clear",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_negation_window() -> usize {
    4
}

fn default_claim_passages() -> usize {
    3
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            contradiction_delta: default_contradiction_delta(),
            contradiction_penalty: default_contradiction_penalty(),
            vision_priority_threshold: default_vision_priority_threshold(),
            retrieval_priority_threshold: default_retrieval_priority_threshold(),
            web_search_confidence: default_web_search_confidence(),
            claim_terms: default_claim_terms(),
            negation_cues: default_negation_cues(),
            negation_window: default_negation_window(),
            claim_passages: default_claim_passages(),
        }
    }
}

// ============= Orchestrator Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Wall-clock budget for one request, gathering included
    #[serde(default = "default_request_deadline_ms")]
    pub request_deadline_ms: u64,

    /// Number of recent request ids remembered for escalation dedup
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Question handed to generation when the query carries only an image
    #[serde(default = "default_image_only_question")]
    pub image_only_question: String,
}

fn default_request_deadline_ms() -> u64 {
    30_000
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_image_only_question() -> String {
    "Describe the clinically relevant findings in the attached image.".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: default_request_deadline_ms(),
            dedup_capacity: default_dedup_capacity(),
            image_only_question: default_image_only_question(),
        }
    }
}

impl OrchestratorConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

// ============= Escalation Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from("./data/escalations")
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            queue_dir: default_queue_dir(),
        }
    }
}

// ============= Gateway Configuration =============

/// Timeout and backoff applied to one gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewaysConfig {
    #[serde(default)]
    pub vision: VisionGatewayConfig,
    #[serde(default)]
    pub retrieval: RetrievalGatewayConfig,
    #[serde(default)]
    pub web_search: WebSearchGatewayConfig,
    #[serde(default)]
    pub generation: GenerationGatewayConfig,
}

impl GatewaysConfig {
    pub fn policy(&self, kind: SourceKind) -> RetryPolicy {
        let (timeout_ms, backoff_ms) = match kind {
            SourceKind::Vision => (self.vision.timeout_ms, self.vision.backoff_base_ms),
            SourceKind::Retrieval => (self.retrieval.timeout_ms, self.retrieval.backoff_base_ms),
            SourceKind::WebSearch => (self.web_search.timeout_ms, self.web_search.backoff_base_ms),
            SourceKind::Generation => {
                (self.generation.timeout_ms, self.generation.backoff_base_ms)
            }
        };
        RetryPolicy {
            max_retries: kind.retry_budget(),
            timeout: Duration::from_millis(timeout_ms),
            backoff_base: Duration::from_millis(backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionGatewayConfig {
    /// Classifier endpoint accepting `{"image_base64": ...}`
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_vision_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_vision_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_base_ms() -> u64 {
    200
}

impl Default for VisionGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_vision_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalGatewayConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default = "default_retrieval_top_k")]
    pub top_k: usize,
    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_retrieval_timeout_ms() -> u64 {
    5_000
}

impl Default for RetrievalGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            collection: None,
            top_k: default_retrieval_top_k(),
            timeout_ms: default_retrieval_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSearchProvider {
    Disabled,
    /// DuckDuckGo via daedra, no API key required
    #[default]
    DuckDuckGo,
    Brave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchGatewayConfig {
    #[serde(default)]
    pub provider: WebSearchProvider,
    /// Environment variable holding the Brave subscription token
    #[serde(default)]
    pub brave_api_key_env: Option<String>,
    #[serde(default)]
    pub brave_endpoint: Option<String>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_web_search_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_web_search_backoff_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_results() -> usize {
    5
}

fn default_web_search_timeout_ms() -> u64 {
    10_000
}

fn default_web_search_backoff_ms() -> u64 {
    250
}

impl Default for WebSearchGatewayConfig {
    fn default() -> Self {
        Self {
            provider: WebSearchProvider::default(),
            brave_api_key_env: None,
            brave_endpoint: None,
            max_results: default_max_results(),
            timeout_ms: default_web_search_timeout_ms(),
            backoff_base_ms: default_web_search_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GenerationProviderConfig {
    /// Any endpoint speaking the OpenAI chat completions protocol
    OpenAi {
        /// Environment variable containing API key
        api_key_env: String,
        #[serde(default = "default_openai_base")]
        api_base: String,
        model: String,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
    Ollama {
        #[serde(default = "default_ollama_url")]
        base_url: String,
        model: String,
    },
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationGatewayConfig {
    #[serde(default)]
    pub provider: Option<GenerationProviderConfig>,
    #[serde(default = "default_generation_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_generation_backoff_ms")]
    pub backoff_base_ms: u64,
}

fn default_generation_timeout_ms() -> u64 {
    60_000
}

fn default_generation_backoff_ms() -> u64 {
    500
}

impl Default for GenerationGatewayConfig {
    fn default() -> Self {
        Self {
            provider: None,
            timeout_ms: default_generation_timeout_ms(),
            backoff_base_ms: default_generation_backoff_ms(),
        }
    }
}

// ============= Configuration Loading & Validation =============

/// Configuration warnings that don't prevent operation but may indicate issues
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub kind: ConfigWarningKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarningKind {
    GatewayDisabled,
    WebSearchDisabled,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors that can occur during configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Environment variable '{0}' referenced in config is not set")]
    MissingEnvVar(String),

    #[error("Watch error: {0}")]
    WatchError(#[from] notify::Error),
}

impl TriangulateConfig {
    /// Load and validate configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: TriangulateConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges, orderings and env var availability
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.confidence;
        for (name, value) in [
            ("confidence.high_threshold", c.high_threshold),
            ("confidence.medium_threshold", c.medium_threshold),
            ("confidence.consensus_score", c.consensus_score),
            ("confidence.consensus_boost", c.consensus_boost),
            ("confidence.generation_floor", c.generation_floor),
            ("confidence.generation_ceiling", c.generation_ceiling),
            (
                "confidence.missing_logprobs_confidence",
                c.missing_logprobs_confidence,
            ),
            ("confidence.min_vision_confidence", c.min_vision_confidence),
            ("confidence.low_retrieval_score", c.low_retrieval_score),
            ("router.web_search_threshold", self.router.web_search_threshold),
            ("merge.contradiction_delta", self.merge.contradiction_delta),
            ("merge.contradiction_penalty", self.merge.contradiction_penalty),
            (
                "merge.vision_priority_threshold",
                self.merge.vision_priority_threshold,
            ),
            (
                "merge.retrieval_priority_threshold",
                self.merge.retrieval_priority_threshold,
            ),
            ("merge.web_search_confidence", self.merge.web_search_confidence),
        ] {
            validate_unit_interval(name, value)?;
        }

        if c.medium_threshold > c.high_threshold {
            return Err(ConfigError::ValidationError(format!(
                "confidence.medium_threshold ({}) must not exceed confidence.high_threshold ({})",
                c.medium_threshold, c.high_threshold
            )));
        }

        if c.generation_floor > c.generation_ceiling {
            return Err(ConfigError::ValidationError(
                "confidence.generation_floor must not exceed confidence.generation_ceiling"
                    .to_string(),
            ));
        }

        if !(c.logprob_floor.is_finite() && c.logprob_floor < 0.0) {
            return Err(ConfigError::ValidationError(
                "confidence.logprob_floor must be a finite negative number".to_string(),
            ));
        }

        if c.retrieval_top_k == 0 || self.gateways.retrieval.top_k == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval top_k must be at least 1".to_string(),
            ));
        }

        if self.orchestrator.request_deadline_ms == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.request_deadline_ms must be positive".to_string(),
            ));
        }

        if self.orchestrator.dedup_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.dedup_capacity must be positive".to_string(),
            ));
        }

        for kind in SourceKind::ALL {
            if self.gateways.policy(kind).timeout.is_zero() {
                return Err(ConfigError::ValidationError(format!(
                    "gateways.{}.timeout_ms must be positive",
                    kind
                )));
            }
        }

        for (name, endpoint) in [
            ("gateways.vision.endpoint", &self.gateways.vision.endpoint),
            ("gateways.retrieval.endpoint", &self.gateways.retrieval.endpoint),
            (
                "gateways.web_search.brave_endpoint",
                &self.gateways.web_search.brave_endpoint,
            ),
        ] {
            if let Some(url) = endpoint {
                if url.trim().is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "{} must not be empty when set",
                        name
                    )));
                }
            }
        }

        let single_word = |w: &str| w.split_whitespace().count() == 1;
        if self.merge.claim_terms.iter().any(|t| {
            !single_word(&t.term) || t.opposite.as_deref().is_some_and(|o| !single_word(o))
        }) {
            return Err(ConfigError::ValidationError(
                "merge.claim_terms entries must be single words".to_string(),
            ));
        }

        if self.gateways.web_search.provider == WebSearchProvider::Brave {
            match self.gateways.web_search.brave_api_key_env {
                Some(ref env) => self.validate_env_var(env)?,
                None => {
                    return Err(ConfigError::ValidationError(
                        "gateways.web_search.brave_api_key_env is required for the brave provider"
                            .to_string(),
                    ));
                }
            }
        }

        if let Some(GenerationProviderConfig::OpenAi { ref api_key_env, .. }) =
            self.gateways.generation.provider
        {
            self.validate_env_var(api_key_env)?;
        }

        Ok(())
    }

    /// Validate configuration and report gateways that will never be called
    pub fn validate_with_warnings(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        self.validate()?;

        let mut warnings = Vec::new();

        for (kind, configured) in [
            (SourceKind::Vision, self.gateways.vision.endpoint.is_some()),
            (
                SourceKind::Retrieval,
                self.gateways.retrieval.endpoint.is_some(),
            ),
            (
                SourceKind::Generation,
                self.gateways.generation.provider.is_some(),
            ),
        ] {
            if !configured {
                warnings.push(ConfigWarning {
                    kind: ConfigWarningKind::GatewayDisabled,
                    message: format!(
                        "No {} backend configured; every {} call will fail as unavailable",
                        kind, kind
                    ),
                });
            }
        }

        if self.router.web_search_enabled
            && self.gateways.web_search.provider == WebSearchProvider::Disabled
        {
            warnings.push(ConfigWarning {
                kind: ConfigWarningKind::WebSearchDisabled,
                message: "router.web_search_enabled is set but gateways.web_search.provider is disabled"
                    .to_string(),
            });
        }

        Ok(warnings)
    }

    fn validate_env_var(&self, name: &str) -> Result<(), ConfigError> {
        std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
        Ok(())
    }

    /// Get a resolved value from an env var reference
    pub fn resolve_env(&self, env_name: &str) -> Option<String> {
        std::env::var(env_name).ok()
    }
}

fn validate_unit_interval(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )))
    }
}

// ============= Hot Reloading Configuration Manager =============

/// Quiet period after a file event before the config is re-read.
const RELOAD_SETTLE: Duration = Duration::from_millis(250);

/// Shared handle to the live configuration.
///
/// Readers take a snapshot with [`ConfigManager::config`]; a reload swaps the
/// whole config atomically and never touches snapshots already handed out.
pub struct ConfigManager {
    current: Arc<ArcSwap<TriangulateConfig>>,
    path: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ConfigManager {
    /// Load `path` and manage it. Relative paths are resolved against the
    /// working directory so the watcher sees the same file.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = std::path::absolute(path.as_ref()).map_err(ConfigError::ReadError)?;
        let config = TriangulateConfig::load(&path)?;
        Ok(Self::with_path(config, path))
    }

    /// Manage an in-memory config with no backing file.
    pub fn from_config(config: TriangulateConfig) -> Self {
        Self::with_path(config, PathBuf::from("triangulate.toml"))
    }

    fn with_path(config: TriangulateConfig, path: PathBuf) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(config)),
            path,
            watcher: Mutex::new(None),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<TriangulateConfig> {
        self.current.load_full()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file now. An invalid file leaves the current config in place.
    pub fn reload(&self) -> Result<(), ConfigError> {
        reload_into(&self.current, &self.path)
    }

    /// Reload whenever the file changes on disk. Bursts of events (editors
    /// write, truncate and rename) collapse into a single reload.
    pub fn watch(&self) -> Result<(), ConfigError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name)
                {
                    let _ = tx.send(());
                }
            }
            Ok(_) => {}
            Err(e) => error!("Config watcher error: {:?}", e),
        })?;

        // The parent directory survives the file being replaced
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        *self.watcher.lock() = Some(watcher);

        let current = Arc::clone(&self.current);
        let path = self.path.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(RELOAD_SETTLE).await;
                while rx.try_recv().is_ok() {}
                if let Err(e) = reload_into(&current, &path) {
                    warn!("Keeping previous configuration: {}", e);
                }
            }
        });

        info!("Watching {:?} for configuration changes", self.path);
        Ok(())
    }
}

fn reload_into(current: &ArcSwap<TriangulateConfig>, path: &Path) -> Result<(), ConfigError> {
    let config = TriangulateConfig::load(path)?;
    current.store(Arc::new(config));
    info!("Configuration reloaded from {:?}", path);
    Ok(())
}
