//! # Domain Entities
//!
//! Core entities of the session/presence core. The durable ones map
//! directly to their database tables; each has an associated repository
//! trait implemented in the infrastructure layer.
//!
//! - **AuthSession**: one logical device login; outlives individual tokens
//! - **AuthToken**: one issued access/refresh credential, keyed by jti

mod session;
mod token;

pub use session::{AuthSession, SessionRepository};
pub use token::{AuthToken, TokenRepository, TokenType};

#[cfg(test)]
pub use session::MockSessionRepository;
#[cfg(test)]
pub use token::MockTokenRepository;
