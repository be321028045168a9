//! Mock gateways and queues for testing.
//!
//! [`Scripted`] implements every backend trait for its payload type, so one
//! type covers vision, retrieval, web search and generation. Responses are
//! played back in order; once the script runs out the fallback repeats.
//!
//! ```ignore
//! // Fails twice with a transport error, then answers
//! let retrieval = ScriptedRetrieval::ok(passages(&[0.8]))
//!     .then_err(ErrorKind::Transport("reset".into()))
//!     .then_err(ErrorKind::Transport("reset".into()));
//! ```
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use triangulate::escalation::{EscalationItem, EscalationStatus, QueueError};
use triangulate::gateways::{
    GenerationBackend, GenerationRequest, RetrievalBackend, VisionBackend, WebSearchBackend,
};
use triangulate::types::{
    ErrorKind, EscalationId, GenerationOutput, ImageBlob, Passage, VisionFinding, WebResult,
};
use triangulate::utils::toml_config::TriangulateConfig;
use triangulate::{
    ConfigManager, EscalationQueue, Gateways, InMemoryEscalationQueue, Orchestrator,
};

pub type ScriptedVision = Scripted<VisionFinding>;
pub type ScriptedRetrieval = Scripted<Vec<Passage>>;
pub type ScriptedWebSearch = Scripted<Vec<WebResult>>;
pub type ScriptedGeneration = Scripted<GenerationOutput>;

/// Backend that replays a script of results.
pub struct Scripted<T> {
    script: Mutex<VecDeque<Result<T, ErrorKind>>>,
    fallback: Result<T, ErrorKind>,
    delay: Duration,
    calls: AtomicUsize,
    inputs: Mutex<Vec<String>>,
}

impl<T: Clone + Send + Sync> Scripted<T> {
    pub fn ok(value: T) -> Self {
        Self::with_fallback(Ok(value))
    }

    pub fn err(error: ErrorKind) -> Self {
        Self::with_fallback(Err(error))
    }

    fn with_fallback(fallback: Result<T, ErrorKind>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Queue an error to be returned before the fallback.
    pub fn then_err(self, error: ErrorKind) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Sleep this long before every answer.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Query text, image size or prompt seen by each call.
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }

    async fn answer(&self, input: String) -> Result<T, ErrorKind> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input);
        let next = self.script.lock().pop_front();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl VisionBackend for Scripted<VisionFinding> {
    async fn classify(&self, image: &ImageBlob) -> Result<VisionFinding, ErrorKind> {
        self.answer(format!("{} bytes", image.len())).await
    }

    fn name(&self) -> &str {
        "scripted-vision"
    }
}

#[async_trait]
impl RetrievalBackend for Scripted<Vec<Passage>> {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, ErrorKind> {
        let mut passages = self.answer(query.to_string()).await?;
        passages.truncate(top_k);
        Ok(passages)
    }

    fn name(&self) -> &str {
        "scripted-retrieval"
    }
}

#[async_trait]
impl WebSearchBackend for Scripted<Vec<WebResult>> {
    async fn search(&self, query: &str, _max_results: usize) -> Result<Vec<WebResult>, ErrorKind> {
        self.answer(query.to_string()).await
    }

    fn name(&self) -> &str {
        "scripted-web"
    }
}

#[async_trait]
impl GenerationBackend for Scripted<GenerationOutput> {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ErrorKind> {
        self.answer(request.prompt()).await
    }

    fn name(&self) -> &str {
        "scripted-generation"
    }
}

/// In-memory queue whose first appends fail, optionally after a delay.
pub struct FlakyQueue {
    inner: InMemoryEscalationQueue,
    failures_left: AtomicUsize,
    delay: Duration,
    appends: AtomicUsize,
}

impl FlakyQueue {
    /// Every append fails.
    pub fn failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    /// The first `failures` appends fail, later ones are stored.
    pub fn failing_first(failures: usize) -> Self {
        Self {
            inner: InMemoryEscalationQueue::new(),
            failures_left: AtomicUsize::new(failures),
            delay: Duration::ZERO,
            appends: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every append.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Append attempts, failed ones included.
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EscalationQueue for FlakyQueue {
    async fn append(&self, item: EscalationItem) -> Result<EscalationId, QueueError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if fail {
            return Err(QueueError::Persistence("disk full".to_string()));
        }
        self.inner.append(item).await
    }

    async fn list(
        &self,
        status: Option<EscalationStatus>,
    ) -> Result<Vec<EscalationItem>, QueueError> {
        self.inner.list(status).await
    }

    async fn get(&self, id: EscalationId) -> Result<EscalationItem, QueueError> {
        self.inner.get(id).await
    }

    async fn transition(
        &self,
        id: EscalationId,
        next: EscalationStatus,
        note: Option<String>,
    ) -> Result<EscalationItem, QueueError> {
        self.inner.transition(id, next, note).await
    }
}

// ============= Fixtures =============

pub fn vision(label: &str, confidence: f64) -> VisionFinding {
    VisionFinding {
        label: label.to_string(),
        confidence,
    }
}

/// Neutral passages (no claim terms) with the given scores.
pub fn passages(scores: &[f64]) -> Vec<Passage> {
    scores
        .iter()
        .enumerate()
        .map(|(i, score)| Passage {
            text: format!("Reference passage {} on lung imaging.", i + 1),
            score: *score,
            source_id: format!("guideline-{}", i + 1),
        })
        .collect()
}

pub fn web_results(count: usize) -> Vec<WebResult> {
    (1..=count)
        .map(|i| WebResult {
            title: format!("Result {}", i),
            url: format!("https://example.org/{}", i),
            snippet: "Updated clinical guidance.".to_string(),
        })
        .collect()
}

pub fn generation(text: &str, logprobs: Option<Vec<f64>>) -> GenerationOutput {
    GenerationOutput {
        text: text.to_string(),
        per_token_logprobs: logprobs,
    }
}

/// Defaults with millisecond backoffs so retry tests stay fast.
pub fn fast_config() -> TriangulateConfig {
    let mut config = TriangulateConfig::default();
    config.gateways.vision.backoff_base_ms = 1;
    config.gateways.retrieval.backoff_base_ms = 1;
    config.gateways.web_search.backoff_base_ms = 1;
    config.gateways.generation.backoff_base_ms = 1;
    config
}

pub fn orchestrator(
    config: TriangulateConfig,
    gateways: Gateways,
    queue: Arc<dyn EscalationQueue>,
) -> Orchestrator {
    Orchestrator::new(
        Arc::new(ConfigManager::from_config(config)),
        gateways,
        queue,
    )
}
