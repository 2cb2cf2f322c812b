//! Repository Implementations
//!
//! PostgreSQL implementations of the domain repository traits.

mod session_repository;
mod token_repository;

pub use session_repository::PgSessionRepository;
pub use token_repository::PgTokenRepository;
