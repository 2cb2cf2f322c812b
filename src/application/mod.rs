//! # Application Layer
//!
//! Use-case services: the token rotation protocol, the sliding-window rate
//! limiter, and the abuse engine. Depends on the domain layer only through
//! its traits.

pub mod services;

pub use services::*;
