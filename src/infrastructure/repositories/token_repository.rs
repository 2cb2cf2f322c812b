//! Token Repository Implementation
//!
//! PostgreSQL implementation of the TokenRepository trait. The rotation
//! update is the one operation in the whole core that relies on storage-side
//! atomicity: a conditional UPDATE whose affected-row count decides the race
//! between two concurrent refresh calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::domain::{AuthToken, TokenRepository, TokenType};
use crate::shared::error::AppError;

/// Database row representation matching the auth_tokens table schema.
#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    jti: Uuid,
    username: String,
    session_id: Option<Uuid>,
    token_type: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    revoked_at: Option<DateTime<Utc>>,
    replaced_by: Option<Uuid>,
    last_used_at: DateTime<Utc>,
    user_agent: Option<String>,
    ip_address: Option<String>,
}

impl TokenRow {
    fn into_token(self) -> AuthToken {
        AuthToken {
            jti: self.jti,
            username: self.username,
            session_id: self.session_id,
            token_type: TokenType::from_str(&self.token_type),
            created_at: self.created_at,
            expires_at: self.expires_at,
            revoked_at: self.revoked_at,
            replaced_by: self.replaced_by,
            last_used_at: self.last_used_at,
            user_agent: self.user_agent,
            ip_address: self.ip_address,
        }
    }
}

/// PostgreSQL token repository implementation.
#[derive(Clone)]
pub struct PgTokenRepository {
    pool: PgPool,
}

impl PgTokenRepository {
    /// Create a new PgTokenRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenRepository for PgTokenRepository {
    async fn insert_if_absent(&self, token: &AuthToken) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO auth_tokens (
                jti, username, session_id, token_type, created_at, expires_at,
                revoked_at, replaced_by, last_used_at, user_agent, ip_address
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (jti) DO NOTHING
            "#,
        )
        .bind(token.jti)
        .bind(&token.username)
        .bind(token.session_id)
        .bind(token.token_type.as_str())
        .bind(token.created_at)
        .bind(token.expires_at)
        .bind(token.revoked_at)
        .bind(token.replaced_by)
        .bind(token.last_used_at)
        .bind(&token.user_agent)
        .bind(&token.ip_address)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, jti: Uuid) -> Result<Option<AuthToken>, AppError> {
        let row = sqlx::query_as::<_, TokenRow>(
            r#"
            SELECT jti, username, session_id, token_type, created_at, expires_at,
                   revoked_at, replaced_by, last_used_at, user_agent, ip_address
            FROM auth_tokens
            WHERE jti = $1
            "#,
        )
        .bind(jti)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_token()))
    }

    async fn mark_replaced(
        &self,
        jti: Uuid,
        replacement: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        // The compare-and-swap: only an unrevoked, never-replaced row can
        // be rotated, evaluated by the store itself.
        let result = sqlx::query(
            r#"
            UPDATE auth_tokens
            SET replaced_by = $2, last_used_at = $3
            WHERE jti = $1 AND revoked_at IS NULL AND replaced_by IS NULL
            "#,
        )
        .bind(jti)
        .bind(replacement)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn bind_session(&self, jti: Uuid, session_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE auth_tokens
            SET session_id = $2
            WHERE jti = $1 AND session_id IS NULL
            "#,
        )
        .bind(jti)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn revoke_for_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE auth_tokens
            SET revoked_at = $2
            WHERE session_id = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn revoke_all_for_user(
        &self,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE auth_tokens
            SET revoked_at = $2
            WHERE username = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(username)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn revoke_all_except_session(
        &self,
        username: &str,
        keep: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE auth_tokens
            SET revoked_at = $3
            WHERE username = $1
              AND (session_id IS NULL OR session_id <> $2)
              AND revoked_at IS NULL
            "#,
        )
        .bind(username)
        .bind(keep)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
