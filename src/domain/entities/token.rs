//! Auth token entity and repository trait.
//!
//! One row per issued credential, keyed by `jti`. Refresh tokens are
//! single-use: rotation writes `replaced_by` exactly once via a conditional
//! update, and that update is the only thing standing between two concurrent
//! refresh calls and a double rotation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shared::error::AppError;

/// Credential kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn from_str(s: &str) -> Self {
        match s {
            "refresh" => Self::Refresh,
            _ => Self::Access,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Represents one issued token.
///
/// Maps to the `auth_tokens` table:
/// - jti: UUID PRIMARY KEY
/// - username: VARCHAR(64) NOT NULL
/// - session_id: UUID NULL (NULL only for legacy pre-session tokens)
/// - token_type: VARCHAR(10) NOT NULL
/// - created_at / expires_at / revoked_at / last_used_at: TIMESTAMPTZ
/// - replaced_by: UUID NULL (write-once, refresh rotation)
/// - user_agent: TEXT NULL
/// - ip_address: VARCHAR(45) NULL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub jti: Uuid,
    pub username: String,
    pub session_id: Option<Uuid>,
    pub token_type: TokenType,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    /// The jti that superseded this refresh token, set exactly once.
    pub replaced_by: Option<Uuid>,
    pub last_used_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl AuthToken {
    /// A refresh token is ACTIVE iff not revoked, not replaced, not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none()
            && self.replaced_by.is_none()
            && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }
}

/// Repository trait for token data access.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Persist a token with `INSERT ... ON CONFLICT (jti) DO NOTHING`
    /// semantics. A jti collision is a no-op, not an error, to tolerate
    /// at-least-once issuance bookkeeping.
    async fn insert_if_absent(&self, token: &AuthToken) -> Result<(), AppError>;

    /// Find a token by jti.
    async fn find(&self, jti: Uuid) -> Result<Option<AuthToken>, AppError>;

    /// Atomically rotate a refresh token: set `replaced_by` and
    /// `last_used_at` iff the row is neither revoked nor already replaced.
    /// Returns true iff exactly one row was updated; false means another
    /// concurrent refresh won the race.
    async fn mark_replaced(
        &self,
        jti: Uuid,
        replacement: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Bind a legacy pre-session token to a session created on the fly.
    async fn bind_session(&self, jti: Uuid, session_id: Uuid) -> Result<(), AppError>;

    /// Revoke every non-revoked token bound to a session. Returns rows affected.
    async fn revoke_for_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    /// Revoke every token of a user, regardless of session binding.
    async fn revoke_all_for_user(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;

    /// Revoke every token of a user except those bound to one session.
    /// Legacy tokens with no binding are revoked too.
    async fn revoke_all_except_session(
        &self,
        username: &str,
        keep: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn refresh_token(now: DateTime<Utc>) -> AuthToken {
        AuthToken {
            jti: Uuid::new_v4(),
            username: "alice".into(),
            session_id: Some(Uuid::new_v4()),
            token_type: TokenType::Refresh,
            created_at: now,
            expires_at: Some(now + Duration::days(7)),
            revoked_at: None,
            replaced_by: None,
            last_used_at: now,
            user_agent: None,
            ip_address: None,
        }
    }

    #[test]
    fn active_requires_unrevoked_unreplaced_unexpired() {
        let now = Utc::now();
        let token = refresh_token(now);
        assert!(token.is_active(now));

        let mut revoked = token.clone();
        revoked.revoked_at = Some(now);
        assert!(!revoked.is_active(now));

        let mut replaced = token.clone();
        replaced.replaced_by = Some(Uuid::new_v4());
        assert!(!replaced.is_active(now));

        let mut expired = token;
        expired.expires_at = Some(now - Duration::seconds(1));
        assert!(!expired.is_active(now));
    }

    #[test]
    fn missing_expiry_means_no_expiry() {
        let now = Utc::now();
        let mut token = refresh_token(now);
        token.expires_at = None;
        assert!(token.is_active(now));
        assert!(!token.is_expired(now));
    }
}
