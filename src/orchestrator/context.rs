use crate::types::RequestId;
use crate::utils::toml_config::TriangulateConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-request context threaded through every stage.
///
/// Holds the configuration snapshot taken at admission, so a hot reload never
/// changes policy halfway through a request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    config: Arc<TriangulateConfig>,
    deadline: Instant,
    cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(
        request_id: RequestId,
        config: Arc<TriangulateConfig>,
        cancel: CancellationToken,
    ) -> Self {
        let deadline = Instant::now() + config.orchestrator.request_deadline();
        Self {
            request_id,
            config,
            deadline,
            cancel,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn config(&self) -> &TriangulateConfig {
        &self.config
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_past_deadline(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
