//! Prometheus metrics for the HTTP surface
//!
//! Every routed request is counted and timed by [`track_requests`], labelled
//! with its route template so path parameters never widen the label set.
//! Query outcomes add escalation and fusion-failure counters. The registry is
//! private to one [`ApiMetrics`], so tests can build as many as they like.

use crate::confidence::ConfidenceLevel;
use crate::AppState;
use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, HistogramVec, IntCounter, IntCounterVec,
    Registry, TextEncoder,
};
use std::time::{Duration, Instant};

/// Gateway calls dominate latency, so buckets reach the request deadline.
const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

pub struct ApiMetrics {
    requests_total: IntCounterVec,
    latency_seconds: HistogramVec,
    escalations_total: IntCounterVec,
    fusion_failures_total: IntCounter,
    registry: Registry,
}

impl ApiMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = register_int_counter_vec_with_registry!(
            "triangulate_api_requests_total",
            "API requests processed, by route and HTTP status",
            &["endpoint", "status"],
            registry
        )?;

        let latency_seconds = register_histogram_vec_with_registry!(
            "triangulate_api_latency_seconds",
            "API request latency in seconds, by route",
            &["endpoint"],
            LATENCY_BUCKETS.to_vec(),
            registry
        )?;

        let escalations_total = register_int_counter_vec_with_registry!(
            "triangulate_escalations_total",
            "Query responses handed to human review, by confidence level",
            &["level"],
            registry
        )?;

        let fusion_failures_total = register_int_counter_with_registry!(
            "triangulate_fusion_failures_total",
            "Queries where no source produced a usable signal",
            registry
        )?;

        Ok(Self {
            requests_total,
            latency_seconds,
            escalations_total,
            fusion_failures_total,
            registry,
        })
    }

    pub fn observe_request(&self, endpoint: &str, status: u16, elapsed: Duration) {
        self.requests_total
            .with_label_values(&[endpoint, &status.to_string()])
            .inc();
        self.latency_seconds
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_escalation(&self, level: ConfidenceLevel) {
        self.escalations_total
            .with_label_values(&[&level.to_string()])
            .inc();
    }

    pub fn record_fusion_failure(&self) {
        self.fusion_failures_total.inc();
    }

    /// Everything registered, in the Prometheus text exposition format.
    pub fn export(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Count and time every request by its matched route.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let started = Instant::now();

    let response = next.run(req).await;

    state
        .metrics
        .observe_request(&endpoint, response.status().as_u16(), started.elapsed());
    response
}
