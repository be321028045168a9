//! HTTP API Handlers and Routes
//!
//! The REST surface of triangulate, built on the Axum web framework.
//!
//! # API Endpoints
//!
//! ## Health
//! - `GET /health` - Liveness check
//!
//! ## Query (`/api/query`)
//! - `POST /api/query` - Submit `{text?, image_base64?, temporal_hint?, request_id?}`
//!   and receive the merged answer, confidence profile and escalation status
//!
//! ## Escalations (`/api/escalations`)
//! - `GET /api/escalations?status=` - List items, oldest first
//! - `GET /api/escalations/stats` - Counts per status
//! - `GET /api/escalations/{id}` - One item
//! - `POST /api/escalations/{id}/transition` - `{status, reviewer_note?}`
//!
//! # Errors
//!
//! Every error body is `{"error": ..., "code": ...}`. `invalid_input` is 400,
//! `not_found` 404, `invalid_transition` 409, `fusion_impossible` 502 and
//! `queue_persistence` 500.

/// Request and response handlers for all API endpoints.
pub mod handlers;
/// Router configuration and route definitions.
pub mod routes;
