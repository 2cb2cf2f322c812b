//! External collaborator implementations.
//!
//! Thin PostgreSQL-backed implementations of the domain ports. Each is a
//! small query against tables owned by the surrounding application; the
//! core treats their schemas as given.

use argon2::{
    password_hash::{PasswordHash, PasswordVerifier},
    Argon2,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;

use crate::domain::{
    CredentialVerifier, FriendsProvider, PermissionChecker, PresenceProfile, PresenceStatus,
    ProfileStore, RoomDirectory, RoomInfo, RuntimeSettings, SanctionKind, Sanctions,
};
use crate::shared::error::AppError;

/// Password verification against the users table (Argon2id hashes).
#[derive(Clone)]
pub struct PgCredentialVerifier {
    pool: PgPool,
}

impl PgCredentialVerifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialVerifier for PgCredentialVerifier {
    async fn verify(&self, username: &str, password: &str) -> Result<bool, AppError> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT password_hash FROM users WHERE username = $1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;

        let Some(hash) = hash else {
            return Ok(false);
        };

        let parsed = PasswordHash::new(&hash)
            .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

/// Friends-list query over the friendships table.
#[derive(Clone)]
pub struct PgFriendsProvider {
    pool: PgPool,
}

impl PgFriendsProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FriendsProvider for PgFriendsProvider {
    async fn friends_of(&self, username: &str) -> Result<Vec<String>, AppError> {
        let friends = sqlx::query_scalar::<_, String>(
            r#"
            SELECT CASE WHEN username_a = $1 THEN username_b ELSE username_a END
            FROM friendships
            WHERE username_a = $1 OR username_b = $1
            "#,
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        Ok(friends)
    }
}

/// Sanction checks plus the automatic-mute write issued by the abuse engine.
#[derive(Clone)]
pub struct PgSanctions {
    pool: PgPool,
}

impl PgSanctions {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Sanctions for PgSanctions {
    async fn is_sanctioned(&self, username: &str, kind: SanctionKind) -> Result<bool, AppError> {
        let active: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT TRUE
            FROM sanctions
            WHERE username = $1 AND kind = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            LIMIT 1
            "#,
        )
        .bind(username)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(active.unwrap_or(false))
    }

    async fn is_room_banned(&self, username: &str, room: &str) -> Result<bool, AppError> {
        let active: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT TRUE
            FROM room_bans
            WHERE username = $1 AND room = $2
              AND (expires_at IS NULL OR expires_at > NOW())
            LIMIT 1
            "#,
        )
        .bind(username)
        .bind(room)
        .fetch_optional(&self.pool)
        .await?;

        Ok(active.unwrap_or(false))
    }

    async fn apply_auto_mute(&self, username: &str, minutes: i64) -> Result<(), AppError> {
        let expires_at = Utc::now() + Duration::minutes(minutes);
        sqlx::query(
            r#"
            INSERT INTO sanctions (username, kind, reason, issued_by, expires_at)
            VALUES ($1, 'mute', 'automatic: rate-limit strikes', 'system', $2)
            "#,
        )
        .bind(username)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Permission checks against the surrounding RBAC tables.
#[derive(Clone)]
pub struct PgPermissionChecker {
    pool: PgPool,
}

impl PgPermissionChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PermissionChecker for PgPermissionChecker {
    async fn has_permission(&self, username: &str, permission: &str) -> Result<bool, AppError> {
        let granted: Option<bool> = sqlx::query_scalar(
            r#"
            SELECT TRUE
            FROM user_permissions
            WHERE username = $1 AND permission = $2
            LIMIT 1
            "#,
        )
        .bind(username)
        .bind(permission)
        .fetch_optional(&self.pool)
        .await?;

        Ok(granted.unwrap_or(false))
    }
}

/// Live-tunable knobs, read from the runtime_settings table on every call
/// so admin changes apply without a restart.
#[derive(Clone)]
pub struct PgRuntimeSettings {
    pool: PgPool,
}

impl PgRuntimeSettings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuntimeSettings for PgRuntimeSettings {
    async fn get_int(&self, key: &str) -> Result<Option<i64>, AppError> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT value FROM runtime_settings WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }
}

/// Base-room metadata lookup over the rooms table.
#[derive(Clone)]
pub struct PgRoomDirectory {
    pool: PgPool,
}

impl PgRoomDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RoomRow {
    locked: bool,
    invite_only: bool,
    age_gated: bool,
    capacity: Option<i64>,
    slowmode_seconds: i64,
}

#[async_trait]
impl RoomDirectory for PgRoomDirectory {
    async fn find_room(&self, base: &str) -> Result<Option<RoomInfo>, AppError> {
        let row = sqlx::query_as::<_, RoomRow>(
            r#"
            SELECT locked, invite_only, age_gated, capacity, slowmode_seconds
            FROM rooms
            WHERE name = $1
            "#,
        )
        .bind(base)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| RoomInfo {
            locked: r.locked,
            invite_only: r.invite_only,
            age_gated: r.age_gated,
            capacity: r.capacity,
            slowmode_seconds: r.slowmode_seconds,
        }))
    }
}

/// Persisted profile state: online flag, chosen presence, status text.
#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn set_online(&self, username: &str, online: bool) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET online = $2 WHERE username = $1")
            .bind(username)
            .bind(online)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_presence(
        &self,
        username: &str,
        status: PresenceStatus,
        status_text: Option<String>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET presence = $2, status_text = $3 WHERE username = $1")
            .bind(username)
            .bind(status.as_str())
            .bind(status_text)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn presence_of(&self, username: &str) -> Result<PresenceProfile, AppError> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT presence, status_text FROM users WHERE username = $1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row
            .map(|(presence, status_text)| PresenceProfile {
                status: PresenceStatus::from_str(&presence),
                status_text,
            })
            .unwrap_or_default())
    }
}
