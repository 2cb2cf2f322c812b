//! # Chat Core
//!
//! The session-authentication and live-presence coordination core of a
//! real-time chat server:
//! - Login, single-use refresh-token rotation, replay detection, and
//!   session revocation cascades over PostgreSQL
//! - A process-local connection registry with room/voice rosters,
//!   autoscaled room sharding, and presence fan-out
//! - Sliding-window rate limiting, abuse strikes, and automatic mutes
//! - Ephemeral 1:1 call and file-transfer signaling
//!
//! ## Architecture
//!
//! The crate follows Clean Architecture principles:
//!
//! - **Domain Layer**: Entities, repository traits, and collaborator ports
//! - **Application Layer**: Rotation protocol, limiter, and abuse engine
//! - **Infrastructure Layer**: PostgreSQL implementations and metrics
//! - **Presentation Layer**: HTTP handlers and the WebSocket gateway
//!
//! ## Module Structure
//!
//! ```text
//! chat_core/
//! +-- config/        Configuration management
//! +-- domain/        Entities, repository traits, and ports
//! +-- application/   Rotation protocol, rate limiter, abuse engine
//! +-- infrastructure/ Database repositories, port implementations, metrics
//! +-- presentation/  HTTP routes, middleware, and the gateway
//! +-- shared/        Common utilities (errors, validation)
//! ```

// Configuration module
pub mod config;

// Domain layer - Core business logic
pub mod domain;

// Application layer - Business services
pub mod application;

// Infrastructure layer - External implementations
pub mod infrastructure;

// Presentation layer - HTTP and WebSocket handlers
pub mod presentation;

// Shared utilities
pub mod shared;

// Application startup and state management
pub mod startup;

// Telemetry and observability
pub mod telemetry;
