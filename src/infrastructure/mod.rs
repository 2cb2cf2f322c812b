//! Infrastructure Layer
//!
//! Contains implementations for external services including:
//! - Database repositories (PostgreSQL)
//! - External-collaborator port implementations
//! - Prometheus metrics

pub mod collaborators;
pub mod database;
pub mod metrics;
pub mod repositories;
