//! Application Services
//!
//! Business logic orchestrating domain entities, ports, and process-local
//! state.

pub mod abuse;
pub mod auth_service;
pub mod rate_limit;

pub use abuse::{AbuseEngine, MessageViolation};
pub use auth_service::{
    AccessContext, AuthError, AuthService, Claims, IssuedCredentials, RefreshError, TokenPair,
};
pub use rate_limit::{RateDecision, SlidingWindowLimiter};
