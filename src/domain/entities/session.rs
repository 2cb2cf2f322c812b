//! Auth session entity and repository trait.
//!
//! Maps to the `auth_sessions` table. One row per logical device/browser
//! login; all issued tokens reference their session, and revoking the
//! session kills every token bound to it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::error::AppError;

/// Represents one logical device session.
///
/// Maps to the `auth_sessions` table:
/// - session_id: UUID PRIMARY KEY
/// - username: VARCHAR(64) NOT NULL
/// - created_at: TIMESTAMPTZ NOT NULL DEFAULT NOW()
/// - last_seen_at: TIMESTAMPTZ NOT NULL (touched by any authenticated call)
/// - last_activity_at: TIMESTAMPTZ NOT NULL (touched only by activity pings)
/// - revoked_at: TIMESTAMPTZ NULL
/// - revoked_reason: VARCHAR(64) NULL
/// - user_agent: TEXT NULL
/// - ip_address: VARCHAR(45) NULL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    /// UUID primary key
    pub session_id: Uuid,

    /// Owning user
    pub username: String,

    pub created_at: DateTime<Utc>,

    /// Touched on any authenticated HTTP call. Never extends the idle window.
    pub last_seen_at: DateTime<Utc>,

    /// Touched only by explicit "I am active" pings; the idle-timeout clock.
    pub last_activity_at: DateTime<Utc>,

    /// When the session was revoked (None if active)
    pub revoked_at: Option<DateTime<Utc>>,

    /// Why the session was revoked ("logout", "idle_timeout", "token_reuse", ...)
    pub revoked_reason: Option<String>,

    pub user_agent: Option<String>,

    pub ip_address: Option<String>,
}

impl AuthSession {
    /// Create a new active session for a user.
    pub fn new(username: &str, user_agent: Option<String>, ip_address: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            username: username.to_string(),
            created_at: now,
            last_seen_at: now,
            last_activity_at: now,
            revoked_at: None,
            revoked_reason: None,
            user_agent,
            ip_address,
        }
    }

    /// A session is active iff it has not been revoked.
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    /// Idle timeout is derived from `last_activity_at` only. A session that
    /// refreshes tokens in the background but never pings activity still
    /// goes idle.
    pub fn is_idle(&self, max_idle_seconds: i64, now: DateTime<Utc>) -> bool {
        max_idle_seconds > 0 && now - self.last_activity_at > Duration::seconds(max_idle_seconds)
    }
}

/// Repository trait for session data access.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Persist a new session.
    async fn create(&self, session: &AuthSession) -> Result<(), AppError>;

    /// Find a session by id.
    async fn find(&self, session_id: Uuid) -> Result<Option<AuthSession>, AppError>;

    /// Touch `last_seen_at` only.
    async fn touch_seen(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError>;

    /// Touch `last_activity_at` (and `last_seen_at`); the explicit liveness ping.
    async fn touch_activity(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError>;

    /// Revoke a single session.
    async fn revoke(
        &self,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Revoke every non-revoked session of a user. Returns rows affected.
    async fn revoke_all_for_user(
        &self,
        username: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    /// Revoke every session of a user except one. Returns rows affected.
    async fn revoke_others(
        &self,
        username: &str,
        keep: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_is_keyed_off_activity_not_seen() {
        let mut session = AuthSession::new("alice", None, None);
        let now = Utc::now();
        session.last_activity_at = now - Duration::seconds(3600);
        // Background refresh traffic touched last_seen recently
        session.last_seen_at = now;

        assert!(session.is_idle(1800, now));
        assert!(!session.is_idle(7200, now));
    }

    #[test]
    fn zero_idle_limit_disables_timeout() {
        let mut session = AuthSession::new("alice", None, None);
        let now = Utc::now();
        session.last_activity_at = now - Duration::days(365);
        assert!(!session.is_idle(0, now));
    }

    #[test]
    fn active_until_revoked() {
        let mut session = AuthSession::new("alice", None, None);
        assert!(session.is_active());
        session.revoked_at = Some(Utc::now());
        assert!(!session.is_active());
    }
}
