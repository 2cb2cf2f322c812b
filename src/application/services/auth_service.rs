//! Authentication Service
//!
//! Login, single-use refresh-token rotation, replay detection, idle-timeout
//! enforcement, and session revocation cascades.
//!
//! The refresh path is the most safety-critical operation in the core. Two
//! near-simultaneous refresh calls from the same legitimate client must not
//! both rotate the token, and must not both fail either: the loser of the
//! rotation race gets a retryable 409. Presenting an already-rotated token
//! outside the grace window is treated as replay of a stolen token and
//! revokes every session the user has.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthSettings;
use crate::domain::{
    AuthSession, AuthToken, CredentialVerifier, SessionRepository, TokenRepository, TokenType,
};
use crate::infrastructure::metrics;
use crate::shared::error::AppError;

/// Session revocation reasons recorded on the session row.
pub mod revoke_reason {
    pub const LOGOUT: &str = "logout";
    pub const LOGOUT_OTHERS: &str = "logout_others";
    pub const LOGOUT_ALL: &str = "logout_all";
    pub const IDLE_TIMEOUT: &str = "idle_timeout";
    pub const SID_MISMATCH: &str = "sid_mismatch";
    pub const TOKEN_REUSE: &str = "token_reuse";
}

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (username)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at time (Unix timestamp)
    pub iat: i64,
    /// Token id, unique per issuance
    pub jti: Uuid,
    /// Bound session id (absent only on legacy pre-session tokens)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<Uuid>,
    /// "access" or "refresh"
    pub typ: String,
}

/// Credential pair plus session handle returned by login.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCredentials {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: Uuid,
}

/// Credential pair returned by a successful rotation.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Identity extracted from a valid access token.
#[derive(Debug, Clone)]
pub struct AccessContext {
    pub username: String,
    pub session_id: Option<Uuid>,
    pub jti: Uuid,
}

/// Authentication errors (login / access validation)
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Session revoked")]
    SessionRevoked,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AppError> for AuthError {
    fn from(e: AppError) -> Self {
        AuthError::Internal(e.to_string())
    }
}

/// Refresh failure taxonomy. Every variant maps to the machine-readable
/// reason string and HTTP status the surrounding transport must surface.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh token unknown")]
    Unknown,

    #[error("refresh token revoked")]
    Revoked,

    #[error("session binding mismatch")]
    SidMismatch,

    #[error("session revoked")]
    SessionRevoked,

    #[error("session idle timeout")]
    IdleTimeout,

    /// Lost a benign rotation race; the caller may retry with its newest
    /// credentials. Nothing was revoked.
    #[error("stale refresh")]
    Stale,

    #[error("refresh token reuse")]
    Reuse,

    /// Store unavailable. For validity decisions unknown is treated as
    /// revoked, so this surfaces like an authentication failure.
    #[error("token store unavailable: {0}")]
    Store(#[source] AppError),
}

impl From<AppError> for RefreshError {
    fn from(e: AppError) -> Self {
        RefreshError::Store(e)
    }
}

impl RefreshError {
    /// Short machine-readable reason string (wire contract).
    pub fn kind(&self) -> &'static str {
        match self {
            RefreshError::Unknown => "refresh_unknown",
            RefreshError::Revoked => "refresh_revoked",
            RefreshError::SidMismatch => "sid_mismatch",
            RefreshError::SessionRevoked => "session_revoked",
            RefreshError::IdleTimeout => "idle_timeout",
            RefreshError::Stale => "stale_refresh",
            RefreshError::Reuse => "refresh_token_reuse",
            RefreshError::Store(_) => "refresh_unknown",
        }
    }

    /// HTTP status the transport must use. Only the benign race is
    /// retryable; everything else re-prompts for login.
    pub fn http_status(&self) -> u16 {
        match self {
            RefreshError::Stale => 409,
            _ => 401,
        }
    }
}

/// AuthService implementation
pub struct AuthService<T, S>
where
    T: TokenRepository,
    S: SessionRepository,
{
    tokens: Arc<T>,
    sessions: Arc<S>,
    credentials: Arc<dyn CredentialVerifier>,
    settings: AuthSettings,
}

impl<T, S> AuthService<T, S>
where
    T: TokenRepository,
    S: SessionRepository,
{
    pub fn new(
        tokens: Arc<T>,
        sessions: Arc<S>,
        credentials: Arc<dyn CredentialVerifier>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            tokens,
            sessions,
            credentials,
            settings,
        }
    }

    /// Authenticate credentials, create a device session, and issue a
    /// session-bound token pair.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        user_agent: Option<String>,
        ip_address: Option<String>,
    ) -> Result<IssuedCredentials, AuthError> {
        if !self.credentials.verify(username, password).await? {
            return Err(AuthError::InvalidCredentials);
        }

        let session = AuthSession::new(username, user_agent.clone(), ip_address.clone());
        self.sessions.create(&session).await?;

        let pair = self
            .issue_pair(username, session.session_id, user_agent, ip_address, Utc::now())
            .await?;

        tracing::info!(username = username, session_id = %session.session_id, "Login, session created");

        Ok(IssuedCredentials {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            session_id: session.session_id,
        })
    }

    /// Rotate a refresh token.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        user_agent: Option<String>,
        ip_address: Option<String>,
    ) -> Result<TokenPair, RefreshError> {
        let outcome = self
            .refresh_at(refresh_token, user_agent, ip_address, Utc::now())
            .await;

        match &outcome {
            Ok(_) => metrics::record_refresh_outcome("rotated"),
            Err(e) => metrics::record_refresh_outcome(e.kind()),
        }

        outcome
    }

    /// Rotation with an explicit clock, the testable core of `refresh`.
    pub async fn refresh_at(
        &self,
        refresh_token: &str,
        user_agent: Option<String>,
        ip_address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, RefreshError> {
        // A token that does not decode (bad signature, expired, garbage)
        // never had a row we can trust; same response as a missing row.
        let claims = self
            .decode_token(refresh_token)
            .map_err(|_| RefreshError::Unknown)?;
        if claims.typ != TokenType::Refresh.as_str() {
            return Err(RefreshError::Unknown);
        }

        let row = self
            .tokens
            .find(claims.jti)
            .await?
            .ok_or(RefreshError::Unknown)?;

        if row.revoked_at.is_some() || row.is_expired(now) {
            return Err(RefreshError::Revoked);
        }

        // Session binding disagreement between the signed claim and the
        // stored row means a forged or spliced token. Fail destructive.
        if let (Some(claimed), Some(bound)) = (claims.sid, row.session_id) {
            if claimed != bound {
                tracing::warn!(username = %row.username, jti = %row.jti, "Refresh sid mismatch, revoking all sessions");
                self.revoke_everything(&row.username, revoke_reason::SID_MISMATCH, now)
                    .await?;
                return Err(RefreshError::SidMismatch);
            }
        }

        let session_id = self.resolve_session(&row, now).await?;

        // Already rotated once. Inside the grace window this is a benign
        // double-submission; outside it, replay of a stolen token.
        if row.replaced_by.is_some() {
            if now - row.last_used_at <= Duration::seconds(self.settings.refresh_grace_seconds) {
                return Err(RefreshError::Stale);
            }
            tracing::warn!(username = %row.username, jti = %row.jti, "Refresh token replayed, revoking all sessions");
            self.revoke_everything(&row.username, revoke_reason::TOKEN_REUSE, now)
                .await?;
            return Err(RefreshError::Reuse);
        }

        // The compare-and-swap. Exactly one concurrent caller sees true.
        let new_jti = Uuid::new_v4();
        if !self.tokens.mark_replaced(row.jti, new_jti, now).await? {
            return Err(RefreshError::Stale);
        }

        let pair = self
            .issue_pair_with_refresh_jti(
                &row.username,
                session_id,
                new_jti,
                user_agent,
                ip_address,
                now,
            )
            .await?;

        self.sessions.touch_seen(session_id, now).await?;

        tracing::debug!(username = %row.username, old_jti = %row.jti, new_jti = %new_jti, "Refresh token rotated");

        Ok(pair)
    }

    /// Resolve the session bound to a refresh token, enforcing revocation
    /// and idle timeout. Legacy pre-session tokens get a session created on
    /// the fly and are re-bound to it.
    async fn resolve_session(
        &self,
        row: &AuthToken,
        now: DateTime<Utc>,
    ) -> Result<Uuid, RefreshError> {
        let Some(session_id) = row.session_id else {
            let session = AuthSession::new(&row.username, row.user_agent.clone(), row.ip_address.clone());
            self.sessions.create(&session).await?;
            self.tokens.bind_session(row.jti, session.session_id).await?;
            return Ok(session.session_id);
        };

        // Unknown session is treated as revoked: fail closed.
        let session = self
            .sessions
            .find(session_id)
            .await?
            .ok_or(RefreshError::SessionRevoked)?;

        if !session.is_active() {
            return Err(RefreshError::SessionRevoked);
        }

        // First caller to observe the idle timeout revokes the session.
        if session.is_idle(self.settings.max_idle_seconds, now) {
            self.revoke_session_at(session_id, revoke_reason::IDLE_TIMEOUT, now)
                .await?;
            return Err(RefreshError::IdleTimeout);
        }

        Ok(session_id)
    }

    /// Revoke one session and cascade to every token bound to it, so all of
    /// a device's outstanding credentials die together.
    pub async fn revoke_session(&self, session_id: Uuid, reason: &str) -> Result<(), AppError> {
        self.revoke_session_at(session_id, reason, Utc::now()).await
    }

    async fn revoke_session_at(
        &self,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.sessions.revoke(session_id, reason, now).await?;
        let revoked = self.tokens.revoke_for_session(session_id, now).await?;
        tracing::info!(session_id = %session_id, reason = reason, tokens_revoked = revoked, "Session revoked");
        Ok(())
    }

    /// Revoke every session and every token of a user, regardless of
    /// session binding. Used on replay detection and password reset.
    pub async fn revoke_everything(
        &self,
        username: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let sessions = self.sessions.revoke_all_for_user(username, reason, now).await?;
        let tokens = self.tokens.revoke_all_for_user(username, now).await?;
        tracing::warn!(
            username = username,
            reason = reason,
            sessions_revoked = sessions,
            tokens_revoked = tokens,
            "All sessions revoked"
        );
        Ok(())
    }

    /// Log out a single device session.
    pub async fn logout(&self, session_id: Uuid) -> Result<(), AppError> {
        self.revoke_session(session_id, revoke_reason::LOGOUT).await
    }

    /// Log out every other device session of a user.
    pub async fn logout_others(&self, username: &str, keep: Uuid) -> Result<(), AppError> {
        let now = Utc::now();
        self.sessions
            .revoke_others(username, keep, revoke_reason::LOGOUT_OTHERS, now)
            .await?;
        // Tokens of the kept session must survive; cascade per-user token
        // revocation would kill them, so revoke per-session instead.
        // The session rows are already revoked; their tokens fail closed on
        // the next validity check, and we proactively revoke user tokens
        // not bound to the kept session.
        let revoked = self.tokens.revoke_all_except_session(username, keep, now).await?;
        tracing::info!(username = username, keep = %keep, tokens_revoked = revoked, "Other sessions logged out");
        Ok(())
    }

    /// Log out every session of a user.
    pub async fn logout_all(&self, username: &str) -> Result<(), AppError> {
        self.revoke_everything(username, revoke_reason::LOGOUT_ALL, Utc::now())
            .await
    }

    /// Explicit liveness ping; the only thing that extends the idle window.
    pub async fn touch_activity(&self, session_id: Uuid) -> Result<(), AppError> {
        self.sessions.touch_activity(session_id, Utc::now()).await
    }

    /// Ordinary-traffic touch; updates `last_seen_at` without extending
    /// the idle window.
    pub async fn touch_seen(&self, session_id: Uuid) -> Result<(), AppError> {
        self.sessions.touch_seen(session_id, Utc::now()).await
    }

    /// Validate an access token: signature and expiry, then the stored row
    /// and its bound session. Store failures and missing rows are both
    /// treated as revoked (fail closed).
    pub async fn validate_access(&self, access_token: &str) -> Result<AccessContext, AuthError> {
        self.validate_access_at(access_token, Utc::now()).await
    }

    async fn validate_access_at(
        &self,
        access_token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessContext, AuthError> {
        let claims = self.decode_token(access_token)?;
        if claims.typ != TokenType::Access.as_str() {
            return Err(AuthError::InvalidToken);
        }

        let row = self
            .tokens
            .find(claims.jti)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if row.revoked_at.is_some() || row.is_expired(now) {
            return Err(AuthError::InvalidToken);
        }

        // Validity is transitive on the bound session.
        if let Some(session_id) = row.session_id {
            let session = self
                .sessions
                .find(session_id)
                .await?
                .ok_or(AuthError::SessionRevoked)?;
            if !session.is_active() {
                return Err(AuthError::SessionRevoked);
            }
        }

        Ok(AccessContext {
            username: row.username,
            session_id: row.session_id,
            jti: row.jti,
        })
    }

    /// Issue a fresh access+refresh pair bound to a session.
    async fn issue_pair(
        &self,
        username: &str,
        session_id: Uuid,
        user_agent: Option<String>,
        ip_address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AppError> {
        self.issue_pair_with_refresh_jti(
            username,
            session_id,
            Uuid::new_v4(),
            user_agent,
            ip_address,
            now,
        )
        .await
    }

    /// Issue a pair where the refresh jti was pre-committed by the rotation
    /// compare-and-swap, so the `replaced_by` pointer stays accurate even
    /// if the insert is retried.
    async fn issue_pair_with_refresh_jti(
        &self,
        username: &str,
        session_id: Uuid,
        refresh_jti: Uuid,
        user_agent: Option<String>,
        ip_address: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AppError> {
        let access_jti = Uuid::new_v4();
        let access_expires = now + Duration::minutes(self.settings.access_token_expiry_minutes);
        let refresh_expires = now + Duration::days(self.settings.refresh_token_expiry_days);

        let access_token = self.encode_token(&Claims {
            sub: username.to_string(),
            exp: access_expires.timestamp(),
            iat: now.timestamp(),
            jti: access_jti,
            sid: Some(session_id),
            typ: TokenType::Access.as_str().to_string(),
        })?;

        let refresh_token = self.encode_token(&Claims {
            sub: username.to_string(),
            exp: refresh_expires.timestamp(),
            iat: now.timestamp(),
            jti: refresh_jti,
            sid: Some(session_id),
            typ: TokenType::Refresh.as_str().to_string(),
        })?;

        for (jti, token_type, expires_at) in [
            (access_jti, TokenType::Access, access_expires),
            (refresh_jti, TokenType::Refresh, refresh_expires),
        ] {
            // Idempotent insert: a jti collision from at-least-once
            // issuance bookkeeping is a no-op.
            self.tokens
                .insert_if_absent(&AuthToken {
                    jti,
                    username: username.to_string(),
                    session_id: Some(session_id),
                    token_type,
                    created_at: now,
                    expires_at: Some(expires_at),
                    revoked_at: None,
                    replaced_by: None,
                    last_used_at: now,
                    user_agent: user_agent.clone(),
                    ip_address: ip_address.clone(),
                })
                .await?;
        }

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    fn encode_token(&self, claims: &Claims) -> Result<String, AppError> {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(self.settings.jwt_secret.as_bytes()),
        )
        .map_err(|e| AppError::Internal(format!("Token generation failed: {}", e)))
    }

    fn decode_token(&self, token: &str) -> Result<Claims, AuthError> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.settings.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })?;

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::MockCredentialVerifier;
    use crate::domain::{MockSessionRepository, MockTokenRepository};
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    fn test_settings() -> AuthSettings {
        AuthSettings {
            jwt_secret: "0123456789abcdef0123456789abcdef".into(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
            refresh_grace_seconds: 10,
            max_idle_seconds: 3600,
        }
    }

    fn service(
        tokens: MockTokenRepository,
        sessions: MockSessionRepository,
    ) -> AuthService<MockTokenRepository, MockSessionRepository> {
        let mut credentials = MockCredentialVerifier::new();
        credentials.expect_verify().returning(|_, _| Ok(true));
        AuthService::new(
            Arc::new(tokens),
            Arc::new(sessions),
            Arc::new(credentials),
            test_settings(),
        )
    }

    fn refresh_row(now: DateTime<Utc>, session_id: Uuid) -> AuthToken {
        AuthToken {
            jti: Uuid::new_v4(),
            username: "alice".into(),
            session_id: Some(session_id),
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

    fn active_session(now: DateTime<Utc>, session_id: Uuid) -> AuthSession {
        AuthSession {
            session_id,
            username: "alice".into(),
            created_at: now,
            last_seen_at: now,
            last_activity_at: now,
            revoked_at: None,
            revoked_reason: None,
            user_agent: None,
            ip_address: None,
        }
    }

    /// Encode a refresh JWT matching a token row.
    fn refresh_jwt(settings: &AuthSettings, row: &AuthToken, now: DateTime<Utc>) -> String {
        encode(
            &Header::default(),
            &Claims {
                sub: row.username.clone(),
                exp: (now + Duration::days(7)).timestamp(),
                iat: now.timestamp(),
                jti: row.jti,
                sid: row.session_id,
                typ: "refresh".into(),
            },
            &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn refresh_with_unknown_jti_fails_without_side_effects() {
        let now = Utc::now();
        let row = refresh_row(now, Uuid::new_v4());
        let jwt = refresh_jwt(&test_settings(), &row, now);

        let mut tokens = MockTokenRepository::new();
        tokens.expect_find().returning(|_| Ok(None));
        let sessions = MockSessionRepository::new();

        let svc = service(tokens, sessions);
        let err = svc.refresh_at(&jwt, None, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "refresh_unknown");
        assert_eq!(err.http_status(), 401);
    }

    #[tokio::test]
    async fn refresh_with_garbage_token_fails() {
        let svc = service(MockTokenRepository::new(), MockSessionRepository::new());
        let err = svc
            .refresh_at("not-a-jwt", None, None, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "refresh_unknown");
    }

    #[tokio::test]
    async fn refresh_with_revoked_token_fails() {
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let mut row = refresh_row(now, session_id);
        row.revoked_at = Some(now - Duration::seconds(5));
        let jwt = refresh_jwt(&test_settings(), &row, now);

        let mut tokens = MockTokenRepository::new();
        let row_clone = row.clone();
        tokens
            .expect_find()
            .with(eq(row.jti))
            .returning(move |_| Ok(Some(row_clone.clone())));

        let svc = service(tokens, MockSessionRepository::new());
        let err = svc.refresh_at(&jwt, None, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "refresh_revoked");
    }

    #[tokio::test]
    async fn sid_mismatch_revokes_every_session_for_the_user() {
        let now = Utc::now();
        let row = refresh_row(now, Uuid::new_v4());
        // Claim asserts a different session than the stored binding.
        let mut forged = row.clone();
        forged.session_id = Some(Uuid::new_v4());
        let jwt = refresh_jwt(&test_settings(), &forged, now);

        let mut tokens = MockTokenRepository::new();
        let row_clone = row.clone();
        tokens
            .expect_find()
            .returning(move |_| Ok(Some(row_clone.clone())));
        tokens
            .expect_revoke_all_for_user()
            .with(eq("alice"), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(3));

        let mut sessions = MockSessionRepository::new();
        sessions
            .expect_revoke_all_for_user()
            .with(
                eq("alice"),
                eq(revoke_reason::SID_MISMATCH),
                mockall::predicate::always(),
            )
            .times(1)
            .returning(|_, _, _| Ok(2));

        let svc = service(tokens, sessions);
        let err = svc.refresh_at(&jwt, None, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "sid_mismatch");
        assert_eq!(err.http_status(), 401);
    }

    #[tokio::test]
    async fn idle_session_is_revoked_by_first_observer() {
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let row = refresh_row(now, session_id);
        let jwt = refresh_jwt(&test_settings(), &row, now);

        let mut session = active_session(now, session_id);
        session.last_activity_at = now - Duration::seconds(7200);
        // Recent background traffic must not rescue an idle session.
        session.last_seen_at = now;

        let mut tokens = MockTokenRepository::new();
        let row_clone = row.clone();
        tokens
            .expect_find()
            .returning(move |_| Ok(Some(row_clone.clone())));
        tokens
            .expect_revoke_for_session()
            .with(eq(session_id), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(2));

        let mut sessions = MockSessionRepository::new();
        let session_clone = session.clone();
        sessions
            .expect_find()
            .returning(move |_| Ok(Some(session_clone.clone())));
        sessions
            .expect_revoke()
            .with(
                eq(session_id),
                eq(revoke_reason::IDLE_TIMEOUT),
                mockall::predicate::always(),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));

        let svc = service(tokens, sessions);
        let err = svc.refresh_at(&jwt, None, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "idle_timeout");
    }

    #[tokio::test]
    async fn replay_inside_grace_window_is_a_retryable_race() {
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let mut row = refresh_row(now, session_id);
        row.replaced_by = Some(Uuid::new_v4());
        row.last_used_at = now - Duration::seconds(5); // within 10s grace
        let jwt = refresh_jwt(&test_settings(), &row, now);

        let mut tokens = MockTokenRepository::new();
        let row_clone = row.clone();
        tokens
            .expect_find()
            .returning(move |_| Ok(Some(row_clone.clone())));
        // No revocation expectations: revoking anything here fails the test.

        let mut sessions = MockSessionRepository::new();
        let session = active_session(now, session_id);
        sessions.expect_find().returning(move |_| Ok(Some(session.clone())));

        let svc = service(tokens, sessions);
        let err = svc.refresh_at(&jwt, None, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "stale_refresh");
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn replay_outside_grace_window_revokes_everything() {
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let mut row = refresh_row(now, session_id);
        row.replaced_by = Some(Uuid::new_v4());
        row.last_used_at = now - Duration::seconds(60);
        let jwt = refresh_jwt(&test_settings(), &row, now);

        let mut tokens = MockTokenRepository::new();
        let row_clone = row.clone();
        tokens
            .expect_find()
            .returning(move |_| Ok(Some(row_clone.clone())));
        tokens
            .expect_revoke_all_for_user()
            .times(1)
            .returning(|_, _| Ok(4));

        let mut sessions = MockSessionRepository::new();
        let session = active_session(now, session_id);
        sessions.expect_find().returning(move |_| Ok(Some(session.clone())));
        sessions
            .expect_revoke_all_for_user()
            .with(
                eq("alice"),
                eq(revoke_reason::TOKEN_REUSE),
                mockall::predicate::always(),
            )
            .times(1)
            .returning(|_, _, _| Ok(2));

        let svc = service(tokens, sessions);
        let err = svc.refresh_at(&jwt, None, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "refresh_token_reuse");
    }

    #[tokio::test]
    async fn losing_the_rotation_cas_returns_stale_without_revoking() {
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let row = refresh_row(now, session_id);
        let jwt = refresh_jwt(&test_settings(), &row, now);

        let mut tokens = MockTokenRepository::new();
        let row_clone = row.clone();
        tokens
            .expect_find()
            .returning(move |_| Ok(Some(row_clone.clone())));
        // Another refresh won between our read and the update.
        tokens.expect_mark_replaced().returning(|_, _, _| Ok(false));

        let mut sessions = MockSessionRepository::new();
        let session = active_session(now, session_id);
        sessions.expect_find().returning(move |_| Ok(Some(session.clone())));

        let svc = service(tokens, sessions);
        let err = svc.refresh_at(&jwt, None, None, now).await.unwrap_err();
        assert_eq!(err.kind(), "stale_refresh");
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn successful_rotation_issues_a_session_bound_pair() {
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let row = refresh_row(now, session_id);
        let jwt = refresh_jwt(&test_settings(), &row, now);

        let mut tokens = MockTokenRepository::new();
        let row_clone = row.clone();
        tokens
            .expect_find()
            .returning(move |_| Ok(Some(row_clone.clone())));
        tokens
            .expect_mark_replaced()
            .with(eq(row.jti), mockall::predicate::always(), eq(now))
            .times(1)
            .returning(|_, _, _| Ok(true));
        tokens
            .expect_insert_if_absent()
            .times(2)
            .returning(|_| Ok(()));

        let mut sessions = MockSessionRepository::new();
        let session = active_session(now, session_id);
        sessions.expect_find().returning(move |_| Ok(Some(session.clone())));
        sessions
            .expect_touch_seen()
            .with(eq(session_id), eq(now))
            .times(1)
            .returning(|_, _| Ok(()));

        let svc = service(tokens, sessions);
        let pair = svc.refresh_at(&jwt, None, None, now).await.unwrap();

        // The new refresh token stays bound to the same session.
        let claims = decode::<Claims>(
            &pair.refresh_token,
            &DecodingKey::from_secret(test_settings().jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .unwrap()
        .claims;
        assert_eq!(claims.sid, Some(session_id));
        assert_eq!(claims.typ, "refresh");
        assert_eq!(claims.sub, "alice");
    }

    #[tokio::test]
    async fn legacy_token_without_session_gets_one_created_and_bound() {
        let now = Utc::now();
        let mut row = refresh_row(now, Uuid::new_v4());
        row.session_id = None;
        let jwt = refresh_jwt(&test_settings(), &row, now);

        let mut tokens = MockTokenRepository::new();
        let row_clone = row.clone();
        tokens
            .expect_find()
            .returning(move |_| Ok(Some(row_clone.clone())));
        tokens
            .expect_bind_session()
            .with(eq(row.jti), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(()));
        tokens.expect_mark_replaced().returning(|_, _, _| Ok(true));
        tokens.expect_insert_if_absent().times(2).returning(|_| Ok(()));

        let mut sessions = MockSessionRepository::new();
        sessions.expect_create().times(1).returning(|_| Ok(()));
        sessions.expect_touch_seen().returning(|_, _| Ok(()));

        let svc = service(tokens, sessions);
        assert!(svc.refresh_at(&jwt, None, None, now).await.is_ok());
    }

    #[tokio::test]
    async fn login_with_bad_credentials_creates_nothing() {
        let tokens = MockTokenRepository::new();
        let sessions = MockSessionRepository::new();
        let mut credentials = MockCredentialVerifier::new();
        credentials.expect_verify().returning(|_, _| Ok(false));

        let svc = AuthService::new(
            Arc::new(tokens),
            Arc::new(sessions),
            Arc::new(credentials),
            test_settings(),
        );

        let err = svc.login("alice", "wrong", None, None).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn login_issues_pair_and_validate_access_accepts_it() {
        let mut tokens = MockTokenRepository::new();
        let inserted: Arc<parking_lot::Mutex<Vec<AuthToken>>> = Arc::new(parking_lot::Mutex::new(vec![]));
        let sink = inserted.clone();
        tokens.expect_insert_if_absent().returning(move |t| {
            sink.lock().push(t.clone());
            Ok(())
        });
        let lookup = inserted.clone();
        tokens.expect_find().returning(move |jti| {
            Ok(lookup.lock().iter().find(|t| t.jti == jti).cloned())
        });

        let mut sessions = MockSessionRepository::new();
        let stored: Arc<parking_lot::Mutex<Option<AuthSession>>> = Arc::new(parking_lot::Mutex::new(None));
        let sink = stored.clone();
        sessions.expect_create().returning(move |s| {
            *sink.lock() = Some(s.clone());
            Ok(())
        });
        let lookup = stored.clone();
        sessions
            .expect_find()
            .returning(move |_| Ok(lookup.lock().clone()));

        let svc = service(tokens, sessions);
        let creds = svc.login("alice", "pw", None, None).await.unwrap();

        let ctx = svc.validate_access(&creds.access_token).await.unwrap();
        assert_eq!(ctx.username, "alice");
        assert_eq!(ctx.session_id, Some(creds.session_id));
    }

    #[tokio::test]
    async fn access_token_dies_with_its_session() {
        let now = Utc::now();
        let session_id = Uuid::new_v4();
        let mut access = refresh_row(now, session_id);
        access.token_type = TokenType::Access;

        let settings = test_settings();
        let jwt = encode(
            &Header::default(),
            &Claims {
                sub: "alice".into(),
                exp: (now + Duration::minutes(15)).timestamp(),
                iat: now.timestamp(),
                jti: access.jti,
                sid: Some(session_id),
                typ: "access".into(),
            },
            &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
        )
        .unwrap();

        let mut tokens = MockTokenRepository::new();
        let row = access.clone();
        tokens.expect_find().returning(move |_| Ok(Some(row.clone())));

        let mut sessions = MockSessionRepository::new();
        let mut session = active_session(now, session_id);
        session.revoked_at = Some(now);
        sessions.expect_find().returning(move |_| Ok(Some(session.clone())));

        let svc = service(tokens, sessions);
        let err = svc.validate_access(&jwt).await.unwrap_err();
        assert!(matches!(err, AuthError::SessionRevoked));
    }
}
