//! Session Repository Implementation
//!
//! PostgreSQL implementation of the SessionRepository trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{AuthSession, SessionRepository};
use crate::shared::error::AppError;

/// Database row representation matching the auth_sessions table schema.
#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    session_id: Uuid,
    username: String,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    revoked_reason: Option<String>,
    user_agent: Option<String>,
    ip_address: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> AuthSession {
        AuthSession {
            session_id: self.session_id,
            username: self.username,
            created_at: self.created_at,
            last_seen_at: self.last_seen_at,
            last_activity_at: self.last_activity_at,
            revoked_at: self.revoked_at,
            revoked_reason: self.revoked_reason,
            user_agent: self.user_agent,
            ip_address: self.ip_address,
        }
    }
}

/// PostgreSQL session repository implementation.
#[derive(Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    /// Create a new PgSessionRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn create(&self, session: &AuthSession) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO auth_sessions (
                session_id, username, created_at, last_seen_at, last_activity_at,
                revoked_at, revoked_reason, user_agent, ip_address
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(session.session_id)
        .bind(&session.username)
        .bind(session.created_at)
        .bind(session.last_seen_at)
        .bind(session.last_activity_at)
        .bind(session.revoked_at)
        .bind(&session.revoked_reason)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, session_id: Uuid) -> Result<Option<AuthSession>, AppError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT session_id, username, created_at, last_seen_at, last_activity_at,
                   revoked_at, revoked_reason, user_agent, ip_address
            FROM auth_sessions
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_session()))
    }

    async fn touch_seen(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE auth_sessions SET last_seen_at = $2 WHERE session_id = $1")
            .bind(session_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn touch_activity(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE auth_sessions
            SET last_activity_at = $2, last_seen_at = $2
            WHERE session_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn revoke(
        &self,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE auth_sessions
            SET revoked_at = $2, revoked_reason = $3
            WHERE session_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn revoke_all_for_user(
        &self,
        username: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET revoked_at = $2, revoked_reason = $3
            WHERE username = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(username)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn revoke_others(
        &self,
        username: &str,
        keep: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET revoked_at = $3, revoked_reason = $4
            WHERE username = $1 AND revoked_at IS NULL AND session_id != $2
            "#,
        )
        .bind(username)
        .bind(keep)
        .bind(now)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
