//! End-to-end orchestration over scripted gateways.

mod common;

use common::mocks::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use triangulate::escalation::{EscalationReason, EscalationStatus};
use triangulate::orchestrator::RequestState;
use triangulate::router::WebSearchTrigger;
use triangulate::types::{ErrorKind, ImageBlob, Query, RequestId, SourceKind};
use triangulate::{
    AppError, ConfidenceLevel, EscalationQueue, FileEscalationQueue, Gateways,
    InMemoryEscalationQueue, SubmitOptions,
};

const IMAGE: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk";

fn image_query(text: Option<&str>) -> Query {
    Query::new(text.map(str::to_string), Some(ImageBlob::new(IMAGE)), false).unwrap()
}

fn memory_queue() -> Arc<InMemoryEscalationQueue> {
    Arc::new(InMemoryEscalationQueue::new())
}

fn approx(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-6,
        "expected {expected}, got {actual}"
    );
}

// ============= Confident Answers =============

#[tokio::test]
async fn test_text_query_with_strong_retrieval_completes() {
    let retrieval = Scripted::ok(passages(&[0.8, 0.75, 0.72])).shared();
    let web = Scripted::ok(web_results(2)).shared();
    let generator = Scripted::ok(generation(
        "Bacterial infection is the usual cause [doc1].",
        Some(vec![0.0, 0.0, 0.0]),
    ))
    .shared();
    let gateways = Gateways::builder()
        .retrieval(retrieval.clone())
        .web_search(web.clone())
        .generation(generator.clone())
        .build();
    let queue = memory_queue();
    let orchestrator = orchestrator(fast_config(), gateways, queue.clone());

    let outcome = orchestrator
        .submit(
            Query::text_only("what causes lobar consolidation").unwrap(),
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    let profile = &outcome.confidence_profile;
    approx(profile.components[&SourceKind::Retrieval], (0.8 + 0.75 + 0.72) / 3.0 + 0.1);
    approx(profile.components[&SourceKind::Generation], 0.95);
    assert_eq!(profile.level, ConfidenceLevel::High);
    assert!(!outcome.escalated);
    assert!(outcome.escalation_id.is_none());
    assert_eq!(
        outcome.answer.as_deref(),
        Some("Bacterial infection is the usual cause [doc1].")
    );

    assert_eq!(web.calls(), 0);
    assert!(!outcome.invoked(SourceKind::WebSearch));
    assert!(outcome.web_search_trigger.is_none());
    assert_eq!(
        outcome.state_trace,
        vec![
            RequestState::Created,
            RequestState::Routing,
            RequestState::Gathering,
            RequestState::Fusing,
            RequestState::Completed,
            RequestState::Terminal,
        ]
    );
    assert!(queue.list(None).await.unwrap().is_empty());

    // Generation sees the retrieved evidence with its citation ids
    let prompt = &generator.inputs()[0];
    assert!(prompt.contains("Question: what causes lobar consolidation"));
    assert!(prompt.contains("[doc1]"));
}

#[tokio::test]
async fn test_temporal_marker_triggers_web_search() {
    let web = Scripted::ok(web_results(3)).shared();
    let gateways = Gateways::builder()
        .retrieval(Scripted::ok(passages(&[0.9])).shared())
        .web_search(web.clone())
        .generation(Scripted::ok(generation("Follow the updated guidance.", None)).shared())
        .build();
    let orchestrator = orchestrator(fast_config(), gateways, memory_queue());

    let outcome = orchestrator
        .submit(
            Query::text_only("latest guidance for community acquired infection").unwrap(),
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(web.calls(), 1);
    assert_eq!(
        outcome.web_search_trigger,
        Some(WebSearchTrigger::TemporalMarker {
            marker: "latest".to_string()
        })
    );
    assert!(outcome.source(SourceKind::WebSearch).unwrap().succeeded);
    // Web results are evidence, never a confidence component
    assert!(!outcome
        .confidence_profile
        .components
        .contains_key(&SourceKind::WebSearch));
    assert!(outcome
        .answer_fragments
        .narrative_fragments
        .iter()
        .any(|f| f.source_kind == SourceKind::WebSearch));
}

#[tokio::test]
async fn test_retrieval_outage_renormalizes_weights() {
    let retrieval = ScriptedRetrieval::err(ErrorKind::Transport("connection reset".into())).shared();
    let gateways = Gateways::builder()
        .vision(Scripted::ok(vision("pneumonia", 0.91)).shared())
        .retrieval(retrieval.clone())
        .web_search(ScriptedWebSearch::ok(Vec::new()).shared())
        .generation(
            Scripted::ok(generation("Findings are consistent with pneumonia.", None)).shared(),
        )
        .build();
    let orchestrator = orchestrator(fast_config(), gateways, memory_queue());

    let outcome = orchestrator
        .submit(image_query(Some("is this pneumonia")), SubmitOptions::default())
        .await
        .unwrap();

    // Initial attempt plus the retrieval retry budget
    assert_eq!(retrieval.calls(), 3);
    let summary = outcome.source(SourceKind::Retrieval).unwrap();
    assert!(!summary.succeeded);
    assert!(matches!(summary.error, Some(ErrorKind::Transport(_))));
    assert_eq!(outcome.web_search_trigger, Some(WebSearchTrigger::RetrievalFailed));

    let profile = &outcome.confidence_profile;
    assert_eq!(
        profile.active_modalities.iter().copied().collect::<Vec<_>>(),
        vec![SourceKind::Vision, SourceKind::Generation]
    );
    approx(profile.weights[&SourceKind::Vision], 0.5 / 0.75);
    approx(profile.weights[&SourceKind::Generation], 0.25 / 0.75);
    approx(profile.overall, 0.91 * (0.5 / 0.75) + 0.75 * (0.25 / 0.75));
    assert!(!outcome.answer_fragments.has_contradictions());
    assert!(outcome
        .warnings
        .iter()
        .any(|w| w.starts_with("retrieval source unavailable")));
}

#[tokio::test]
async fn test_image_only_query_skips_text_gateways() {
    let retrieval = Scripted::ok(passages(&[0.9])).shared();
    let generator = Scripted::ok(generation("Lungs look clear.", None)).shared();
    let gateways = Gateways::builder()
        .vision(Scripted::ok(vision("effusion", 0.93)).shared())
        .retrieval(retrieval.clone())
        .generation(generator.clone())
        .build();
    let orchestrator = orchestrator(fast_config(), gateways, memory_queue());

    let outcome = orchestrator
        .submit(image_query(None), SubmitOptions::default())
        .await
        .unwrap();

    assert_eq!(retrieval.calls(), 0);
    assert!(!outcome.invoked(SourceKind::Retrieval));
    assert!(!outcome.invoked(SourceKind::WebSearch));
    assert!(generator.inputs()[0].contains("Describe the clinically relevant findings"));
    approx(outcome.confidence_profile.overall, 0.8 * 0.93 + 0.2 * 0.75);
}

// ============= Contradictions =============

#[tokio::test]
async fn test_disagreement_within_delta_is_tolerated() {
    // exp(-35/11) maps to a generation confidence of 0.6
    let gateways = Gateways::builder()
        .vision(Scripted::ok(vision("abnormal", 0.9)).shared())
        .generation(
            Scripted::ok(generation(
                "The study appears normal.",
                Some(vec![-35.0 / 11.0]),
            ))
            .shared(),
        )
        .build();
    let orchestrator = orchestrator(fast_config(), gateways, memory_queue());

    let outcome = orchestrator
        .submit(image_query(None), SubmitOptions::default())
        .await
        .unwrap();

    let profile = &outcome.confidence_profile;
    approx(profile.components[&SourceKind::Generation], 0.6);
    assert!(!outcome.answer_fragments.has_contradictions());
    approx(profile.penalty, 0.0);
    approx(profile.overall, 0.8 * 0.9 + 0.2 * 0.6);
    assert_eq!(profile.level, ConfidenceLevel::Medium);
    assert!(!outcome.escalated);
}

#[tokio::test]
async fn test_contradiction_penalizes_and_escalates() {
    let gateways = Gateways::builder()
        .vision(Scripted::ok(vision("abnormal", 0.9)).shared())
        .generation(
            Scripted::ok(generation("The study appears normal.", Some(vec![-10.0]))).shared(),
        )
        .build();
    let queue = memory_queue();
    let orchestrator = orchestrator(fast_config(), gateways, queue.clone());

    let outcome = orchestrator
        .submit(image_query(None), SubmitOptions::default())
        .await
        .unwrap();

    let contradictions = &outcome.answer_fragments.contradictions;
    assert_eq!(contradictions.len(), 1);
    assert_eq!(contradictions[0].subject, "abnormal");
    approx(contradictions[0].confidence_gap, 0.5);

    let profile = &outcome.confidence_profile;
    approx(profile.fused, 0.8 * 0.9 + 0.2 * 0.4);
    approx(profile.penalty, 0.15);
    approx(profile.overall, 0.8 * 0.9 + 0.2 * 0.4 - 0.15);
    assert_eq!(profile.level, ConfidenceLevel::Low);

    assert!(outcome.escalated);
    assert_eq!(outcome.escalation_reasons.len(), 2);
    assert!(matches!(
        outcome.escalation_reasons[1],
        EscalationReason::Contradiction { count: 1, .. }
    ));

    let items = queue.list(None).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].contradictions, *contradictions);
    assert_eq!(
        items[0].draft_answer.as_deref(),
        Some("The study appears normal.")
    );
}

// ============= Escalation =============

#[tokio::test]
async fn test_low_confidence_is_durably_escalated() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(FileEscalationQueue::open(dir.path()).await.unwrap());
    let gateways = Gateways::builder()
        .retrieval(Scripted::ok(passages(&[0.5, 0.4])).shared())
        .generation(Scripted::ok(generation("Dosing depends on weight.", None)).shared())
        .build();
    let orchestrator = orchestrator(fast_config(), gateways, queue.clone());
    let request_id = RequestId::new();

    let outcome = orchestrator
        .submit(
            Query::text_only("what dose of amoxicillin for adults").unwrap(),
            SubmitOptions {
                request_id: Some(request_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    approx(outcome.confidence_profile.overall, 0.6 * 0.45 + 0.4 * 0.75);
    assert_eq!(outcome.confidence_profile.level, ConfidenceLevel::Low);
    assert!(outcome.escalated);
    assert_eq!(
        outcome.state_trace[outcome.state_trace.len() - 2..],
        [RequestState::Escalated, RequestState::Terminal]
    );

    let escalation_id = outcome.escalation_id.unwrap();
    let reopened = FileEscalationQueue::open(dir.path()).await.unwrap();
    let item = reopened.get(escalation_id).await.unwrap();
    assert_eq!(item.request_id, request_id);
    assert_eq!(item.status, EscalationStatus::Pending);
    assert_eq!(
        item.query_snapshot.text(),
        Some("what dose of amoxicillin for adults")
    );
    assert_eq!(item.draft_answer.as_deref(), Some("Dosing depends on weight."));
    assert_eq!(reopened.list(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_replayed_request_escalates_once() {
    let gateways = Gateways::builder()
        .retrieval(Scripted::ok(passages(&[0.5, 0.4])).shared())
        .generation(Scripted::ok(generation("Unclear.", None)).shared())
        .build();
    let queue = memory_queue();
    let orchestrator = orchestrator(fast_config(), gateways, queue.clone());
    let options = SubmitOptions {
        request_id: Some(RequestId::new()),
        ..Default::default()
    };
    let query = Query::text_only("what dose of amoxicillin for adults").unwrap();

    let first = orchestrator
        .submit(query.clone(), options.clone())
        .await
        .unwrap();
    let second = orchestrator.submit(query, options).await.unwrap();

    assert!(first.escalated && second.escalated);
    assert_eq!(first.escalation_id, second.escalation_id);
    assert_eq!(queue.list(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_queue_failure_is_reported() {
    let gateways = Gateways::builder()
        .retrieval(Scripted::ok(passages(&[0.5, 0.4])).shared())
        .generation(Scripted::ok(generation("Unclear.", None)).shared())
        .build();
    let orchestrator = orchestrator(fast_config(), gateways, FlakyQueue::failing().shared());
    let request_id = RequestId::new();

    let err = orchestrator
        .submit(
            Query::text_only("what dose of amoxicillin for adults").unwrap(),
            SubmitOptions {
                request_id: Some(request_id),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    match err {
        AppError::QueuePersistence {
            request_id: failed,
            message,
        } => {
            assert_eq!(failed, request_id);
            assert!(message.contains("disk full"));
        }
        other => panic!("expected QueuePersistence, got {other:?}"),
    }
}

fn doubtful_gateways() -> Gateways {
    Gateways::builder()
        .retrieval(Scripted::ok(passages(&[0.5, 0.4])).shared())
        .generation(Scripted::ok(generation("Unclear.", None)).shared())
        .build()
}

fn replay_of(request_id: RequestId) -> SubmitOptions {
    SubmitOptions {
        request_id: Some(request_id),
        ..Default::default()
    }
}

fn dosing_query() -> Query {
    Query::text_only("what dose of amoxicillin for adults").unwrap()
}

#[tokio::test]
async fn test_concurrent_replays_share_one_append() {
    let queue = FlakyQueue::failing_first(0)
        .delayed(Duration::from_millis(200))
        .shared();
    let orchestrator = orchestrator(fast_config(), doubtful_gateways(), queue.clone());
    let request_id = RequestId::new();

    let (first, second) = tokio::join!(
        orchestrator.submit(dosing_query(), replay_of(request_id)),
        orchestrator.submit(dosing_query(), replay_of(request_id)),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.escalation_id, second.escalation_id);
    assert_eq!(queue.appends(), 1);
    let stored = queue.get(first.escalation_id.unwrap()).await.unwrap();
    assert_eq!(stored.request_id, request_id);
}

#[tokio::test]
async fn test_concurrent_replays_share_a_failed_append() {
    let queue = FlakyQueue::failing()
        .delayed(Duration::from_millis(200))
        .shared();
    let orchestrator = orchestrator(fast_config(), doubtful_gateways(), queue.clone());
    let request_id = RequestId::new();

    let (first, second) = tokio::join!(
        orchestrator.submit(dosing_query(), replay_of(request_id)),
        orchestrator.submit(dosing_query(), replay_of(request_id)),
    );

    // Neither caller may be told the case was escalated
    assert!(matches!(first, Err(AppError::QueuePersistence { .. })));
    assert!(matches!(second, Err(AppError::QueuePersistence { .. })));
    assert_eq!(queue.appends(), 1);
    assert!(queue.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replay_after_failed_append_escalates_again() {
    let queue = FlakyQueue::failing_first(1).shared();
    let orchestrator = orchestrator(fast_config(), doubtful_gateways(), queue.clone());
    let request_id = RequestId::new();

    let err = orchestrator
        .submit(dosing_query(), replay_of(request_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::QueuePersistence { .. }));

    let outcome = orchestrator
        .submit(dosing_query(), replay_of(request_id))
        .await
        .unwrap();
    assert!(outcome.escalated);
    assert_eq!(queue.appends(), 2);
    let stored = queue.get(outcome.escalation_id.unwrap()).await.unwrap();
    assert_eq!(stored.request_id, request_id);
    assert_eq!(
        outcome.warnings.last().map(String::as_str),
        Some(
            "Flagged for expert review due to low confidence; treat this answer as \
             provisional until a reviewer confirms it"
        )
    );
}

#[tokio::test]
async fn test_abandoned_failed_append_is_forgotten() {
    let queue = FlakyQueue::failing_first(1)
        .delayed(Duration::from_millis(100))
        .shared();
    let orchestrator = orchestrator(fast_config(), doubtful_gateways(), queue.clone());
    let request_id = RequestId::new();

    // The caller goes away while its append is still running
    let abandoned = tokio::time::timeout(
        Duration::from_millis(30),
        orchestrator.submit(dosing_query(), replay_of(request_id)),
    )
    .await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(queue.appends(), 1);

    let outcome = orchestrator
        .submit(dosing_query(), replay_of(request_id))
        .await
        .unwrap();
    assert_eq!(queue.appends(), 2);
    queue.get(outcome.escalation_id.unwrap()).await.unwrap();
}

// ============= Failures =============

#[tokio::test]
async fn test_all_sources_failing_is_fusion_impossible() {
    let generator = Scripted::ok(generation("unused", None)).shared();
    let gateways = Gateways::builder()
        .retrieval(ScriptedRetrieval::err(ErrorKind::Rejected("HTTP 401".into())).shared())
        .web_search(ScriptedWebSearch::err(ErrorKind::Rejected("HTTP 403".into())).shared())
        .generation(generator.clone())
        .build();
    let queue = memory_queue();
    let orchestrator = orchestrator(fast_config(), gateways, queue.clone());

    let err = orchestrator
        .submit(
            Query::text_only("what causes lobar consolidation").unwrap(),
            SubmitOptions::default(),
        )
        .await
        .unwrap_err();

    match err {
        AppError::FusionImpossible { failures, .. } => {
            let kinds: Vec<SourceKind> = failures.iter().map(|(kind, _)| *kind).collect();
            assert_eq!(kinds, vec![SourceKind::Retrieval, SourceKind::WebSearch]);
        }
        other => panic!("expected FusionImpossible, got {other:?}"),
    }
    assert_eq!(generator.calls(), 0);
    assert!(queue.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unconfigured_gateways_are_unavailable() {
    let orchestrator = orchestrator(fast_config(), Gateways::default(), memory_queue());

    let err = orchestrator
        .submit(image_query(Some("is this pneumonia")), SubmitOptions::default())
        .await
        .unwrap_err();

    match err {
        AppError::FusionImpossible { failures, .. } => {
            assert!(!failures.is_empty());
            assert!(failures
                .iter()
                .all(|(_, error)| *error == ErrorKind::Unavailable));
        }
        other => panic!("expected FusionImpossible, got {other:?}"),
    }
}

#[tokio::test]
async fn test_deadline_fuses_partial_signals() {
    let mut config = fast_config();
    config.orchestrator.request_deadline_ms = 150;
    let generator = Scripted::ok(generation("unused", None)).shared();
    let gateways = Gateways::builder()
        .vision(Scripted::ok(vision("pneumonia", 0.92)).shared())
        .retrieval(Scripted::ok(passages(&[0.9])).delayed(Duration::from_secs(5)).shared())
        .generation(generator.clone())
        .build();
    let orchestrator = orchestrator(config, gateways, memory_queue());

    let started = std::time::Instant::now();
    let outcome = orchestrator
        .submit(image_query(Some("is this pneumonia")), SubmitOptions::default())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(
        outcome.source(SourceKind::Retrieval).unwrap().error,
        Some(ErrorKind::DeadlineExceeded)
    );
    assert_eq!(
        outcome.source(SourceKind::Generation).unwrap().error,
        Some(ErrorKind::DeadlineExceeded)
    );
    assert_eq!(generator.calls(), 0);
    assert!(!outcome.invoked(SourceKind::WebSearch));

    let profile = &outcome.confidence_profile;
    assert_eq!(
        profile.active_modalities.iter().copied().collect::<Vec<_>>(),
        vec![SourceKind::Vision]
    );
    approx(profile.overall, 0.92);
    assert!(outcome.warnings.iter().any(|w| w.contains("deadline")));
}

#[tokio::test]
async fn test_cancellation_aborts_request() {
    let gateways = Gateways::builder()
        .retrieval(Scripted::ok(passages(&[0.9])).delayed(Duration::from_secs(5)).shared())
        .generation(Scripted::ok(generation("unused", None)).shared())
        .build();
    let queue = memory_queue();
    let orchestrator = orchestrator(fast_config(), gateways, queue.clone());
    let cancel = CancellationToken::new();
    let request_id = RequestId::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = orchestrator
        .submit(
            Query::text_only("what causes lobar consolidation").unwrap(),
            SubmitOptions {
                request_id: Some(request_id),
                cancel: Some(cancel),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Cancelled(id) if id == request_id));
    assert!(queue.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_generation_retried_once() {
    let generator = Scripted::ok(generation("Recovered answer.", None))
        .then_err(ErrorKind::Timeout)
        .shared();
    let gateways = Gateways::builder()
        .retrieval(Scripted::ok(passages(&[0.9, 0.85, 0.8])).shared())
        .generation(generator.clone())
        .build();
    let orchestrator = orchestrator(fast_config(), gateways, memory_queue());

    let outcome = orchestrator
        .submit(
            Query::text_only("what causes lobar consolidation").unwrap(),
            SubmitOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(generator.calls(), 2);
    assert_eq!(outcome.answer.as_deref(), Some("Recovered answer."));
}
