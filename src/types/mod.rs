use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============= Identifiers =============

/// Caller-visible identifier of a single query submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| AppError::InvalidInput(format!("invalid request id '{}': {}", s, e)))
    }
}

/// Identifier of a persisted escalation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EscalationId(Uuid);

impl EscalationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EscalationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EscalationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EscalationId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| AppError::InvalidInput(format!("invalid escalation id '{}': {}", s, e)))
    }
}

// ============= Source Kinds =============

/// The closed set of evidence sources a query can draw on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Vision,
    Retrieval,
    WebSearch,
    Generation,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Vision,
        SourceKind::Retrieval,
        SourceKind::WebSearch,
        SourceKind::Generation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Vision => "vision",
            SourceKind::Retrieval => "retrieval",
            SourceKind::WebSearch => "web_search",
            SourceKind::Generation => "generation",
        }
    }

    /// How many times a transiently failed call to this source is retried.
    pub fn retry_budget(&self) -> u32 {
        match self {
            SourceKind::Vision => 0,
            SourceKind::Retrieval | SourceKind::WebSearch => 2,
            SourceKind::Generation => 1,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============= Query =============

/// Opaque base64-encoded image payload.
///
/// Never decoded by the engine; it is forwarded to the vision gateway as-is.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageBlob(String);

impl ImageBlob {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

// Payloads can be megabytes; keep them out of logs.
impl fmt::Debug for ImageBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageBlob({} bytes)", self.0.len())
    }
}

/// Which modalities a query carries. Selects the row of the fusion weight table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryShape {
    VisionAndText,
    TextOnly,
    VisionOnly,
}

/// A validated, immutable user query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    text: Option<String>,
    image: Option<ImageBlob>,
    #[serde(default)]
    temporal_hint: bool,
}

impl Query {
    /// Build a query, rejecting submissions that carry neither text nor an image.
    pub fn new(text: Option<String>, image: Option<ImageBlob>, temporal_hint: bool) -> Result<Self> {
        let text = text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        if let Some(ref blob) = image {
            if blob.is_empty() {
                return Err(AppError::InvalidInput("image payload is empty".to_string()));
            }
        }

        if text.is_none() && image.is_none() {
            return Err(AppError::InvalidInput(
                "query must carry non-empty text or an image".to_string(),
            ));
        }

        Ok(Self {
            text,
            image,
            temporal_hint,
        })
    }

    pub fn text_only(text: impl Into<String>) -> Result<Self> {
        Self::new(Some(text.into()), None, false)
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn image(&self) -> Option<&ImageBlob> {
        self.image.as_ref()
    }

    pub fn temporal_hint(&self) -> bool {
        self.temporal_hint
    }

    pub fn has_text(&self) -> bool {
        self.text.is_some()
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn shape(&self) -> QueryShape {
        match (self.has_image(), self.has_text()) {
            (true, true) => QueryShape::VisionAndText,
            (true, false) => QueryShape::VisionOnly,
            _ => QueryShape::TextOnly,
        }
    }
}

// ============= Source Signals =============

/// Vision classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionFinding {
    pub label: String,
    pub confidence: f64,
}

/// One retrieved document chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub score: f64,
    pub source_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_token_logprobs: Option<Vec<f64>>,
}

/// Successful gateway payload, one variant per source kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SignalPayload {
    Vision(VisionFinding),
    Retrieval(Vec<Passage>),
    WebSearch(Vec<WebResult>),
    Generation(GenerationOutput),
}

impl SignalPayload {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            SignalPayload::Vision(_) => SourceKind::Vision,
            SignalPayload::Retrieval(_) => SourceKind::Retrieval,
            SignalPayload::WebSearch(_) => SourceKind::WebSearch,
            SignalPayload::Generation(_) => SourceKind::Generation,
        }
    }

    /// The source's own score before normalization, if it reports one.
    fn raw_score(&self) -> Option<f64> {
        match self {
            SignalPayload::Vision(finding) => Some(finding.confidence),
            SignalPayload::Retrieval(passages) => passages
                .iter()
                .map(|p| p.score)
                .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s)))),
            SignalPayload::WebSearch(_) => None,
            SignalPayload::Generation(output) => match output.per_token_logprobs.as_deref() {
                Some(lps) if !lps.is_empty() => {
                    Some(lps.iter().map(|lp| lp.exp()).sum::<f64>() / lps.len() as f64)
                }
                _ => None,
            },
        }
    }
}

/// Why a gateway call produced no usable payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("timed out")]
    Timeout,
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected by upstream: {0}")]
    Rejected(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no backend configured")]
    Unavailable,
    #[error("cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Transient failures are worth retrying; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Transport(_))
    }
}

/// Outcome of one gateway invocation. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSignal {
    source_kind: SourceKind,
    raw_score: Option<f64>,
    payload: Option<SignalPayload>,
    succeeded: bool,
    error: Option<ErrorKind>,
}

impl SourceSignal {
    pub fn success(payload: SignalPayload) -> Self {
        Self {
            source_kind: payload.source_kind(),
            raw_score: payload.raw_score(),
            payload: Some(payload),
            succeeded: true,
            error: None,
        }
    }

    pub fn failure(source_kind: SourceKind, error: ErrorKind) -> Self {
        Self {
            source_kind,
            raw_score: None,
            payload: None,
            succeeded: false,
            error: Some(error),
        }
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }

    pub fn raw_score(&self) -> Option<f64> {
        self.raw_score
    }

    pub fn payload(&self) -> Option<&SignalPayload> {
        self.payload.as_ref()
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn error(&self) -> Option<&ErrorKind> {
        self.error.as_ref()
    }

    pub fn vision(&self) -> Option<&VisionFinding> {
        match self.payload.as_ref() {
            Some(SignalPayload::Vision(finding)) => Some(finding),
            _ => None,
        }
    }

    pub fn passages(&self) -> Option<&[Passage]> {
        match self.payload.as_ref() {
            Some(SignalPayload::Retrieval(passages)) => Some(passages),
            _ => None,
        }
    }

    pub fn web_results(&self) -> Option<&[WebResult]> {
        match self.payload.as_ref() {
            Some(SignalPayload::WebSearch(results)) => Some(results),
            _ => None,
        }
    }

    pub fn generation(&self) -> Option<&GenerationOutput> {
        match self.payload.as_ref() {
            Some(SignalPayload::Generation(output)) => Some(output),
            _ => None,
        }
    }
}

// ============= API Request Types =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub temporal_hint: bool,
    /// Supplied by callers that retry; repeated ids never escalate twice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl QueryRequest {
    pub fn into_query(self) -> Result<(Query, Option<RequestId>)> {
        let query = Query::new(self.text, self.image_base64.map(ImageBlob::new), self.temporal_hint)?;
        Ok((query, self.request_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

// ============= Error Types =============

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No source produced a usable signal for request {request_id}")]
    FusionImpossible {
        request_id: RequestId,
        failures: Vec<(SourceKind, ErrorKind)>,
    },

    #[error("Escalation for request {request_id} could not be persisted: {message}")]
    QueuePersistence {
        request_id: RequestId,
        message: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Request {0} was cancelled")]
    Cancelled(RequestId),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "invalid_input",
            AppError::FusionImpossible { .. } => "fusion_impossible",
            AppError::QueuePersistence { .. } => "queue_persistence",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::Cancelled(_) => "cancelled",
            AppError::Configuration(_) => "configuration",
            AppError::Internal(_) => "internal",
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::FusionImpossible { .. } => StatusCode::BAD_GATEWAY,
            AppError::QueuePersistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition(_) => StatusCode::CONFLICT,
            AppError::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        if let AppError::FusionImpossible { failures, .. } = &self {
            body["failures"] = serde_json::json!(failures
                .iter()
                .map(|(kind, err)| serde_json::json!({ "source": kind, "error": err.to_string() }))
                .collect::<Vec<_>>());
        }

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
