//! Source gateways
//!
//! Every external collaborator sits behind a backend trait, one per
//! [`SourceKind`]. [`Gateways`] wraps the backends with the per-kind timeout
//! and retry policy and turns every outcome, including timeouts, transport
//! faults and cancellation, into a [`SourceSignal`]. Callers never see an
//! error from a gateway invocation.
//!
//! Backends are stateless and shared across requests behind `Arc`.

pub mod generation;
pub mod retrieval;
pub mod vision;
pub mod web_search;

pub use generation::GenerationRequest;
pub use retrieval::HttpRetrievalBackend;
pub use vision::HttpVisionBackend;
pub use web_search::{BraveSearch, DuckDuckGoSearch};

use crate::orchestrator::RequestContext;
use crate::types::{
    AppError, ErrorKind, GenerationOutput, ImageBlob, Passage, SignalPayload, SourceKind,
    SourceSignal, VisionFinding, WebResult,
};
use crate::utils::toml_config::{GatewaysConfig, RetryPolicy, TriangulateConfig, WebSearchProvider};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ============= Backend Traits =============

#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn classify(&self, image: &ImageBlob) -> Result<VisionFinding, ErrorKind>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    /// Ranked passages, best first. An empty list is a valid answer.
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, ErrorKind>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait WebSearchBackend: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<WebResult>, ErrorKind>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ErrorKind>;

    fn name(&self) -> &str;
}

// ============= Gateway Calls =============

/// Input for one gateway invocation.
#[derive(Debug, Clone, Copy)]
pub enum GatewayCall<'a> {
    Vision(&'a ImageBlob),
    Retrieval(&'a str),
    WebSearch(&'a str),
    Generation(&'a GenerationRequest),
}

impl GatewayCall<'_> {
    pub fn kind(&self) -> SourceKind {
        match self {
            GatewayCall::Vision(_) => SourceKind::Vision,
            GatewayCall::Retrieval(_) => SourceKind::Retrieval,
            GatewayCall::WebSearch(_) => SourceKind::WebSearch,
            GatewayCall::Generation(_) => SourceKind::Generation,
        }
    }
}

/// The set of configured backends. Kinds without a backend answer with
/// [`ErrorKind::Unavailable`].
#[derive(Clone, Default)]
pub struct Gateways {
    vision: Option<Arc<dyn VisionBackend>>,
    retrieval: Option<Arc<dyn RetrievalBackend>>,
    web_search: Option<Arc<dyn WebSearchBackend>>,
    generation: Option<Arc<dyn GenerationBackend>>,
}

impl Gateways {
    pub fn builder() -> GatewaysBuilder {
        GatewaysBuilder::default()
    }

    /// Build the HTTP-backed gateways described by the configuration.
    pub fn from_config(config: &TriangulateConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("triangulate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Configuration(format!("HTTP client: {}", e)))?;
        let gateways = &config.gateways;

        let mut builder = Self::builder();

        if let Some(endpoint) = &gateways.vision.endpoint {
            builder = builder.vision(Arc::new(HttpVisionBackend::new(
                client.clone(),
                endpoint.clone(),
            )));
        }

        if let Some(endpoint) = &gateways.retrieval.endpoint {
            builder = builder.retrieval(Arc::new(HttpRetrievalBackend::new(
                client.clone(),
                endpoint.clone(),
                gateways.retrieval.collection.clone(),
            )));
        }

        match gateways.web_search.provider {
            WebSearchProvider::Disabled => {}
            WebSearchProvider::DuckDuckGo => {
                builder = builder.web_search(Arc::new(DuckDuckGoSearch::new()));
            }
            WebSearchProvider::Brave => {
                let key_env = gateways.web_search.brave_api_key_env.as_deref().ok_or_else(|| {
                    AppError::Configuration("brave web search requires brave_api_key_env".into())
                })?;
                let api_key = config.resolve_env(key_env).ok_or_else(|| {
                    AppError::Configuration(format!("environment variable {} is not set", key_env))
                })?;
                let mut brave = BraveSearch::new(client.clone(), api_key);
                if let Some(endpoint) = &gateways.web_search.brave_endpoint {
                    brave = brave.with_endpoint(endpoint.clone());
                }
                builder = builder.web_search(Arc::new(brave));
            }
        }

        if let Some(provider) = &gateways.generation.provider {
            builder = builder.generation(crate::llm::generation_backend(
                provider,
                client.clone(),
                config,
            )?);
        }

        Ok(builder.build())
    }

    pub fn has_backend(&self, kind: SourceKind) -> bool {
        match kind {
            SourceKind::Vision => self.vision.is_some(),
            SourceKind::Retrieval => self.retrieval.is_some(),
            SourceKind::WebSearch => self.web_search.is_some(),
            SourceKind::Generation => self.generation.is_some(),
        }
    }

    /// Invoke one gateway under the request's configuration snapshot.
    ///
    /// Never fails: every fault is folded into a failed signal.
    pub async fn invoke(&self, call: GatewayCall<'_>, ctx: &RequestContext) -> SourceSignal {
        let kind = call.kind();
        let config = ctx.config();
        let policy = config.gateways.policy(kind);
        let cancel = ctx.cancel_token().child_token();
        let started = Instant::now();

        debug!(request_id = %ctx.request_id(), source = %kind, "Invoking gateway");

        let result = self.dispatch(call, &config.gateways, &policy, &cancel).await;

        match result {
            Ok(payload) => {
                debug!(
                    request_id = %ctx.request_id(),
                    source = %kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Gateway succeeded"
                );
                SourceSignal::success(payload)
            }
            Err(error) => {
                warn!(
                    request_id = %ctx.request_id(),
                    source = %kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %error,
                    "Gateway failed"
                );
                SourceSignal::failure(kind, error)
            }
        }
    }

    async fn dispatch(
        &self,
        call: GatewayCall<'_>,
        config: &GatewaysConfig,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<SignalPayload, ErrorKind> {
        let kind = call.kind();
        match call {
            GatewayCall::Vision(image) => {
                let backend = self.vision.as_ref().ok_or(ErrorKind::Unavailable)?;
                with_retries(kind, policy, cancel, || backend.classify(image))
                    .await
                    .map(SignalPayload::Vision)
            }
            GatewayCall::Retrieval(text) => {
                let backend = self.retrieval.as_ref().ok_or(ErrorKind::Unavailable)?;
                let top_k = config.retrieval.top_k;
                with_retries(kind, policy, cancel, || backend.retrieve(text, top_k))
                    .await
                    .map(SignalPayload::Retrieval)
            }
            GatewayCall::WebSearch(text) => {
                let backend = self.web_search.as_ref().ok_or(ErrorKind::Unavailable)?;
                let max_results = config.web_search.max_results;
                with_retries(kind, policy, cancel, || backend.search(text, max_results))
                    .await
                    .map(|mut results| {
                        results.truncate(max_results);
                        SignalPayload::WebSearch(results)
                    })
            }
            GatewayCall::Generation(request) => {
                let backend = self.generation.as_ref().ok_or(ErrorKind::Unavailable)?;
                with_retries(kind, policy, cancel, || backend.generate(request))
                    .await
                    .map(SignalPayload::Generation)
            }
        }
    }
}

impl std::fmt::Debug for Gateways {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateways")
            .field("vision", &self.vision.as_ref().map(|b| b.name().to_string()))
            .field("retrieval", &self.retrieval.as_ref().map(|b| b.name().to_string()))
            .field("web_search", &self.web_search.as_ref().map(|b| b.name().to_string()))
            .field("generation", &self.generation.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

#[derive(Default)]
pub struct GatewaysBuilder {
    inner: Gateways,
}

impl GatewaysBuilder {
    pub fn vision(mut self, backend: Arc<dyn VisionBackend>) -> Self {
        self.inner.vision = Some(backend);
        self
    }

    pub fn retrieval(mut self, backend: Arc<dyn RetrievalBackend>) -> Self {
        self.inner.retrieval = Some(backend);
        self
    }

    pub fn web_search(mut self, backend: Arc<dyn WebSearchBackend>) -> Self {
        self.inner.web_search = Some(backend);
        self
    }

    pub fn generation(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.inner.generation = Some(backend);
        self
    }

    pub fn build(self) -> Gateways {
        self.inner
    }
}

// ============= Retry Loop =============

/// Run `op` under `policy`, retrying transient failures with exponential
/// backoff. Cancellation wins over both the call and the backoff sleep.
pub async fn with_retries<T, F, Fut>(
    kind: SourceKind,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ErrorKind>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ErrorKind>>,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
            res = tokio::time::timeout(policy.timeout, op()) => match res {
                Ok(inner) => inner,
                Err(_) => Err(ErrorKind::Timeout),
            },
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                attempt += 1;
                warn!(
                    source = %kind,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying gateway call"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ErrorKind::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => return Err(error),
        }
    }
}

// ============= HTTP Helpers =============

pub(crate) fn transport_error(err: reqwest::Error) -> ErrorKind {
    if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_decode() {
        ErrorKind::Malformed(err.to_string())
    } else {
        ErrorKind::Transport(err.to_string())
    }
}

/// 5xx, 408 and 429 are transient; any other non-success status is final.
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ErrorKind> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = format!(
        "HTTP {}: {}",
        status.as_u16(),
        body.chars().take(200).collect::<String>()
    );

    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        Err(ErrorKind::Transport(detail))
    } else {
        Err(ErrorKind::Rejected(detail))
    }
}

pub(crate) async fn decode_json<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ErrorKind> {
    let bytes = response.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| ErrorKind::Malformed(e.to_string()))
}
