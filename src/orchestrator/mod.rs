//! Request orchestration
//!
//! [`Orchestrator::submit`] drives one query through the lifecycle in
//! [`state`]: route, gather signals stage by stage, fuse them into a
//! confidence profile and merged result, then either complete or escalate to
//! the human-review queue.
//!
//! Within a stage the planned gateways run concurrently and are joined at a
//! barrier. The barrier is bounded by the request deadline; gateways still
//! outstanding when it passes are recorded as failed and fusion proceeds with
//! whatever arrived. Cancelling the request token aborts gathering, but an
//! escalation append that has started always runs to completion.

pub mod context;
pub mod state;

pub use context::RequestContext;
pub use state::{Lifecycle, RequestState};

use crate::confidence::{ConfidenceBuilder, ConfidenceLevel, ConfidenceProfile};
use crate::escalation::{EscalationItem, EscalationQueue, EscalationReason};
use crate::gateways::{GatewayCall, Gateways, GenerationRequest};
use crate::merge::{MergedResult, Merger};
use crate::router::{PlanStep, QueryRouter, WebSearchTrigger};
use crate::types::{
    AppError, ErrorKind, EscalationId, Query, RequestId, Result, SourceKind, SourceSignal,
};
use crate::utils::toml_config::{ConfigManager, TriangulateConfig};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Caller-supplied knobs for one submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Reuse a request id, e.g. when a client retries. Generated if absent.
    pub request_id: Option<RequestId>,
    /// Cancelled when the caller goes away.
    pub cancel: Option<CancellationToken>,
}

/// Per-source summary returned with every outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source_kind: SourceKind,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl From<&SourceSignal> for SourceSummary {
    fn from(signal: &SourceSignal) -> Self {
        Self {
            source_kind: signal.source_kind(),
            succeeded: signal.succeeded(),
            raw_score: signal.raw_score(),
            error: signal.error().cloned(),
        }
    }
}

/// Result of a request that reached `Terminal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub request_id: RequestId,
    /// Generated answer text, if generation succeeded
    pub answer: Option<String>,
    pub answer_fragments: MergedResult,
    pub confidence_profile: ConfidenceProfile,
    pub escalated: bool,
    pub escalation_id: Option<EscalationId>,
    #[serde(default)]
    pub escalation_reasons: Vec<EscalationReason>,
    #[serde(default)]
    pub web_search_trigger: Option<WebSearchTrigger>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub sources: Vec<SourceSummary>,
    pub state_trace: Vec<RequestState>,
}

impl QueryOutcome {
    pub fn source(&self, kind: SourceKind) -> Option<&SourceSummary> {
        self.sources.iter().find(|s| s.source_kind == kind)
    }

    pub fn invoked(&self, kind: SourceKind) -> bool {
        self.source(kind).is_some()
    }
}

/// Signals gathered across all stages of one request.
#[derive(Debug, Default)]
struct Gathered {
    signals: Vec<SourceSignal>,
    web_search_trigger: Option<WebSearchTrigger>,
    deadline_exceeded: bool,
}

impl Gathered {
    fn signal(&self, kind: SourceKind) -> Option<&SourceSignal> {
        self.signals.iter().find(|s| s.source_kind() == kind)
    }

    fn any_succeeded(&self) -> bool {
        self.signals.iter().any(|s| s.succeeded())
    }

    fn record_deadline(&mut self, kinds: impl IntoIterator<Item = SourceKind>) {
        self.signals.extend(
            kinds
                .into_iter()
                .map(|kind| SourceSignal::failure(kind, ErrorKind::DeadlineExceeded)),
        );
    }
}

pub struct Orchestrator {
    config_manager: Arc<ConfigManager>,
    gateways: Gateways,
    queue: Arc<dyn EscalationQueue>,
    // Request id -> its escalation append, so a replayed request never appends twice
    escalated: EscalationLedger,
}

impl Orchestrator {
    pub fn new(
        config_manager: Arc<ConfigManager>,
        gateways: Gateways,
        queue: Arc<dyn EscalationQueue>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config_manager.config().orchestrator.dedup_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            config_manager,
            gateways,
            queue,
            escalated: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn gateways(&self) -> &Gateways {
        &self.gateways
    }

    pub fn queue(&self) -> &Arc<dyn EscalationQueue> {
        &self.queue
    }

    /// Run one query to completion.
    ///
    /// The configuration is snapshotted once here; a reload during the
    /// request has no effect on it.
    pub async fn submit(&self, query: Query, options: SubmitOptions) -> Result<QueryOutcome> {
        let request_id = options.request_id.unwrap_or_default();
        let cancel = options.cancel.unwrap_or_default();
        let ctx = RequestContext::new(request_id, self.config_manager.config(), cancel);
        self.run(query, &ctx).await
    }

    /// Run one query under an explicit context.
    pub async fn run(&self, query: Query, ctx: &RequestContext) -> Result<QueryOutcome> {
        let config = ctx.config();
        let request_id = ctx.request_id();
        let mut lifecycle = Lifecycle::new(request_id);

        info!(
            request_id = %request_id,
            shape = ?query.shape(),
            has_text = query.has_text(),
            has_image = query.has_image(),
            "Request admitted"
        );

        // ============= Routing =============
        lifecycle.advance(RequestState::Routing)?;
        let router = QueryRouter::new(config.router.clone());
        let plan = router.plan(&query);

        // ============= Gathering =============
        lifecycle.advance(RequestState::Gathering)?;
        let builder = ConfidenceBuilder::new(config.confidence.clone());
        let merger = Merger::new(config.merge.clone());
        let gathered = self
            .gather(&query, plan.steps(), &router, &builder, &merger, ctx)
            .await?;

        if !gathered.any_succeeded() {
            lifecycle.advance(RequestState::Failed)?;
            let failures: Vec<(SourceKind, ErrorKind)> = gathered
                .signals
                .iter()
                .filter_map(|s| s.error().map(|e| (s.source_kind(), e.clone())))
                .collect();
            error!(
                request_id = %request_id,
                failed_sources = failures.len(),
                "Every gateway failed, nothing to fuse"
            );
            return Err(AppError::FusionImpossible {
                request_id,
                failures,
            });
        }

        // ============= Fusing =============
        lifecycle.advance(RequestState::Fusing)?;
        let shape = query.shape();
        let mut profile = builder.build(shape, &gathered.signals);
        let merged = merger.merge(shape, &gathered.signals, &profile.components);

        if merged.has_contradictions() {
            profile = profile.with_penalty(config.merge.contradiction_penalty, &builder.thresholds());
            warn!(
                request_id = %request_id,
                contradictions = merged.contradictions.len(),
                penalty = config.merge.contradiction_penalty,
                overall = profile.overall,
                "Sources contradict each other, confidence penalized"
            );
        }

        let reasons = escalation_reasons(&profile, &merged, config);
        let answer = gathered
            .signal(SourceKind::Generation)
            .and_then(|s| s.generation())
            .map(|g| g.text.clone());
        let mut warnings = collect_warnings(config, &gathered, &merged);

        info!(
            request_id = %request_id,
            overall = profile.overall,
            level = %profile.level,
            active = profile.active_modalities.len(),
            "Confidence fused"
        );

        let escalation_id = if reasons.is_empty() {
            lifecycle.advance(RequestState::Completed)?;
            None
        } else {
            lifecycle.advance(RequestState::Escalated)?;
            let item = EscalationItem::new(EscalationId::new(), request_id, query, profile.clone())
                .with_reasons(reasons.clone())
                .with_contradictions(merged.contradictions.clone())
                .with_draft_answer(answer.clone());
            let escalation_id = self.escalate(item).await?;
            warnings.push(review_notice(profile.level).to_string());
            Some(escalation_id)
        };
        lifecycle.advance(RequestState::Terminal)?;

        Ok(QueryOutcome {
            request_id,
            answer,
            answer_fragments: merged,
            confidence_profile: profile,
            escalated: escalation_id.is_some(),
            escalation_id,
            escalation_reasons: reasons,
            web_search_trigger: gathered.web_search_trigger,
            warnings,
            sources: gathered.signals.iter().map(SourceSummary::from).collect(),
            state_trace: lifecycle.into_trace(),
        })
    }

    async fn gather(
        &self,
        query: &Query,
        steps: &[PlanStep],
        router: &QueryRouter,
        builder: &ConfidenceBuilder,
        merger: &Merger,
        ctx: &RequestContext,
    ) -> Result<Gathered> {
        let mut gathered = Gathered::default();

        for step in steps {
            if ctx.is_cancelled() {
                return Err(AppError::Cancelled(ctx.request_id()));
            }

            match step {
                PlanStep::Concurrent(kinds) => {
                    if gathered.deadline_exceeded {
                        gathered.record_deadline(kinds.iter().copied());
                        continue;
                    }
                    let calls: Vec<GatewayCall<'_>> = kinds
                        .iter()
                        .filter_map(|kind| match kind {
                            SourceKind::Vision => query.image().map(GatewayCall::Vision),
                            SourceKind::Retrieval => query.text().map(GatewayCall::Retrieval),
                            SourceKind::WebSearch => query.text().map(GatewayCall::WebSearch),
                            SourceKind::Generation => None,
                        })
                        .collect();
                    self.run_stage(&calls, ctx, &mut gathered).await?;
                }
                PlanStep::WebSearchIfNeeded => {
                    // Decided at most once per request
                    if gathered.deadline_exceeded || gathered.web_search_trigger.is_some() {
                        continue;
                    }
                    let Some(trigger) =
                        router.web_search_trigger(query, gathered.signal(SourceKind::Retrieval))
                    else {
                        continue;
                    };
                    let Some(text) = query.text() else {
                        continue;
                    };
                    info!(request_id = %ctx.request_id(), trigger = %trigger, "Web search triggered");
                    gathered.web_search_trigger = Some(trigger);
                    self.run_stage(&[GatewayCall::WebSearch(text)], ctx, &mut gathered)
                        .await?;
                }
                PlanStep::Generate => {
                    if gathered.deadline_exceeded {
                        gathered.record_deadline([SourceKind::Generation]);
                        continue;
                    }
                    if !gathered.any_succeeded() {
                        continue;
                    }
                    let request = self.generation_request(query, &gathered, builder, merger, ctx);
                    self.run_stage(&[GatewayCall::Generation(&request)], ctx, &mut gathered)
                        .await?;
                }
            }
        }

        Ok(gathered)
    }

    /// Evidence and preliminary confidence handed to generation.
    fn generation_request(
        &self,
        query: &Query,
        gathered: &Gathered,
        builder: &ConfidenceBuilder,
        merger: &Merger,
        ctx: &RequestContext,
    ) -> GenerationRequest {
        let shape = query.shape();
        let preliminary = builder.build(shape, &gathered.signals);
        let question = query
            .text()
            .map(str::to_string)
            .unwrap_or_else(|| ctx.config().orchestrator.image_only_question.clone());
        GenerationRequest::new(
            question,
            merger.fragments(shape, &gathered.signals),
            preliminary.level,
        )
    }

    /// Run the calls concurrently and wait for all of them, or for the
    /// request deadline, whichever comes first. Signals are appended in call
    /// order so identical inputs always produce identical signal lists.
    async fn run_stage(
        &self,
        calls: &[GatewayCall<'_>],
        ctx: &RequestContext,
        gathered: &mut Gathered,
    ) -> Result<()> {
        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .enumerate()
            .map(|(index, call)| async move { (index, self.gateways.invoke(*call, ctx).await) })
            .collect();
        let mut outstanding: BTreeSet<usize> = (0..calls.len()).collect();
        let mut arrived: Vec<(usize, SourceSignal)> = Vec::with_capacity(calls.len());

        let deadline = tokio::time::sleep_until(ctx.deadline());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel_token().cancelled() => {
                    warn!(request_id = %ctx.request_id(), "Request cancelled while gathering");
                    return Err(AppError::Cancelled(ctx.request_id()));
                }
                _ = &mut deadline => {
                    warn!(
                        request_id = %ctx.request_id(),
                        outstanding = outstanding.len(),
                        "Request deadline exceeded, fusing partial signals"
                    );
                    for index in std::mem::take(&mut outstanding) {
                        arrived.push((
                            index,
                            SourceSignal::failure(calls[index].kind(), ErrorKind::DeadlineExceeded),
                        ));
                    }
                    gathered.deadline_exceeded = true;
                    break;
                }
                next = pending.next() => match next {
                    Some((index, signal)) => {
                        outstanding.remove(&index);
                        arrived.push((index, signal));
                    }
                    None => break,
                },
            }
        }

        arrived.sort_by_key(|(index, _)| *index);
        gathered
            .signals
            .extend(arrived.into_iter().map(|(_, signal)| signal));
        Ok(())
    }

    /// Durably append `item`, at most once per request id.
    ///
    /// The first escalation for a request id spawns the append and records it
    /// in the ledger as in flight; replays await that same append instead of
    /// starting their own. The spawned task owns the ledger update, so a
    /// failed append is forgotten (and may be retried) even if every caller
    /// has gone away.
    async fn escalate(&self, item: EscalationItem) -> Result<EscalationId> {
        let request_id = item.request_id;
        let append = {
            let mut ledger = self.escalated.lock();
            match ledger.get(&request_id).cloned() {
                Some(existing) => {
                    info!(
                        request_id = %request_id,
                        escalation_id = %existing.item_id,
                        "Request already escalated, awaiting its append"
                    );
                    existing
                }
                None => {
                    let append = self.spawn_append(item);
                    ledger.put(request_id, append.clone());
                    append
                }
            }
        };

        match append.outcome.await {
            Ok(escalation_id) => {
                info!(
                    request_id = %request_id,
                    escalation_id = %escalation_id,
                    "Escalated for human review"
                );
                Ok(escalation_id)
            }
            Err(message) => Err(AppError::QueuePersistence {
                request_id,
                message,
            }),
        }
    }

    fn spawn_append(&self, item: EscalationItem) -> PendingAppend {
        let request_id = item.request_id;
        let item_id = item.id;
        let queue = Arc::clone(&self.queue);
        let ledger = Arc::clone(&self.escalated);

        let task = tokio::spawn(async move {
            let appended = queue.append(item).await.map_err(|e| e.to_string());
            if let Err(message) = &appended {
                error!(request_id = %request_id, error = %message, "Escalation append failed");
                forget_append(&ledger, request_id, item_id);
            }
            appended
        });

        let ledger = Arc::clone(&self.escalated);
        let outcome = async move {
            match task.await {
                Ok(appended) => appended,
                Err(join_error) => {
                    forget_append(&ledger, request_id, item_id);
                    Err(join_error.to_string())
                }
            }
        }
        .boxed()
        .shared();

        PendingAppend { item_id, outcome }
    }
}

/// An escalation append, shared by every submission of one request id.
#[derive(Clone)]
struct PendingAppend {
    item_id: EscalationId,
    outcome: Shared<BoxFuture<'static, std::result::Result<EscalationId, String>>>,
}

type EscalationLedger = Arc<Mutex<LruCache<RequestId, PendingAppend>>>;

/// Drop the ledger entry for a failed append, unless a newer one replaced it.
fn forget_append(ledger: &EscalationLedger, request_id: RequestId, item_id: EscalationId) {
    let mut ledger = ledger.lock();
    if ledger
        .peek(&request_id)
        .is_some_and(|pending| pending.item_id == item_id)
    {
        ledger.pop(&request_id);
    }
}

/// Low confidence always escalates; a contradiction escalates when the
/// penalized confidence falls below the medium threshold.
fn escalation_reasons(
    profile: &ConfidenceProfile,
    merged: &MergedResult,
    config: &TriangulateConfig,
) -> Vec<EscalationReason> {
    let mut reasons = Vec::new();
    if profile.level == ConfidenceLevel::Low {
        reasons.push(EscalationReason::LowConfidence {
            overall: profile.overall,
        });
    }
    if merged.has_contradictions() && profile.overall < config.confidence.medium_threshold {
        reasons.push(EscalationReason::Contradiction {
            count: merged.contradictions.len(),
            overall: profile.overall,
        });
    }
    reasons
}

/// Last warning on an escalated outcome, telling the caller a reviewer will
/// look at the case.
fn review_notice(level: ConfidenceLevel) -> &'static str {
    match level {
        ConfidenceLevel::Low => {
            "Flagged for expert review due to low confidence; treat this answer as \
             provisional until a reviewer confirms it"
        }
        _ => "Flagged for additional review; a reviewer will verify this answer",
    }
}

/// Human-readable caveats attached to the response.
fn collect_warnings(
    config: &TriangulateConfig,
    gathered: &Gathered,
    merged: &MergedResult,
) -> Vec<String> {
    let mut warnings = Vec::new();

    if let Some(finding) = gathered.signal(SourceKind::Vision).and_then(|s| s.vision()) {
        if finding.confidence < config.confidence.min_vision_confidence {
            warnings.push(format!(
                "Image classification confidence is low ({:.1}%)",
                finding.confidence * 100.0
            ));
        }
    }

    if let Some(passages) = gathered
        .signal(SourceKind::Retrieval)
        .and_then(|s| s.passages())
    {
        if passages.is_empty() {
            warnings.push("No relevant context found in the knowledge base".to_string());
        } else {
            let mean = passages.iter().map(|p| p.score).sum::<f64>() / passages.len() as f64;
            if mean < config.confidence.low_retrieval_score {
                warnings.push(format!(
                    "Retrieved context has low relevance (mean score {:.2})",
                    mean
                ));
            }
        }
    }

    for signal in gathered.signals.iter().filter(|s| !s.succeeded()) {
        if let Some(error) = signal.error() {
            warnings.push(format!("{} source unavailable: {}", signal.source_kind(), error));
        }
    }

    if gathered.deadline_exceeded {
        warnings.push("Request deadline exceeded; answer is based on partial evidence".to_string());
    }

    for contradiction in &merged.contradictions {
        warnings.push(contradiction.description.clone());
    }

    warnings
}
