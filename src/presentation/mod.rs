//! # Presentation Layer
//!
//! HTTP routes, middleware, and the WebSocket gateway.

pub mod gateway;
pub mod http;
pub mod middleware;
