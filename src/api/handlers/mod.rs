//! API request handlers.
//!
//! This module contains all HTTP request handlers organized by functionality.

/// Escalation queue review handlers.
pub mod escalations;
/// Liveness handler.
pub mod health;
/// Prometheus scrape handler.
pub mod metrics;
/// Query submission handler.
pub mod query;
