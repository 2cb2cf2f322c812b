//! External collaborator ports.
//!
//! The core consumes a handful of functions from the surrounding
//! application (credential checks, friends lists, sanctions, permissions,
//! live-tunable settings, room metadata, profile flags). Each is a trait so
//! the application layer stays testable and the wiring explicit.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::shared::error::AppError;

/// Kinds of moderation sanction the core asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanctionKind {
    Ban,
    Kick,
    Mute,
}

impl SanctionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Kick => "kick",
            Self::Mute => "mute",
        }
    }
}

/// User-chosen presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Busy,
    Invisible,
}

impl PresenceStatus {
    pub fn from_str(s: &str) -> Self {
        match s {
            "away" => Self::Away,
            "busy" => Self::Busy,
            "invisible" => Self::Invisible,
            _ => Self::Online,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Away => "away",
            Self::Busy => "busy",
            Self::Invisible => "invisible",
        }
    }
}

/// A user's chosen presence plus optional custom status text.
#[derive(Debug, Clone, Default)]
pub struct PresenceProfile {
    pub status: PresenceStatus,
    pub status_text: Option<String>,
}

/// Metadata about a base room, as known to the surrounding application.
#[derive(Debug, Clone, Default)]
pub struct RoomInfo {
    pub locked: bool,
    pub invite_only: bool,
    pub age_gated: bool,
    /// Per-room occupancy cap overriding the global one (None = global).
    pub capacity: Option<i64>,
    /// Per-room minimum seconds between one user's messages (0 = off).
    pub slowmode_seconds: i64,
}

/// Password verification against the user store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> Result<bool, AppError>;
}

/// Friends-list query; order is irrelevant.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FriendsProvider: Send + Sync {
    async fn friends_of(&self, username: &str) -> Result<Vec<String>, AppError>;
}

/// Moderation sanction checks plus the one write the core performs: the
/// automatic mute issued by the abuse engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sanctions: Send + Sync {
    async fn is_sanctioned(&self, username: &str, kind: SanctionKind) -> Result<bool, AppError>;

    async fn is_room_banned(&self, username: &str, room: &str) -> Result<bool, AppError>;

    async fn apply_auto_mute(&self, username: &str, minutes: i64) -> Result<(), AppError>;
}

/// Permission checks against the surrounding RBAC system.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn has_permission(&self, username: &str, permission: &str) -> Result<bool, AppError>;
}

/// Live-tunable numeric knobs. Consulted on every relevant check rather
/// than cached at startup, so admin changes apply without a restart.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuntimeSettings: Send + Sync {
    async fn get_int(&self, key: &str) -> Result<Option<i64>, AppError>;
}

/// Resolve a knob, falling back to the static default on absence or store
/// failure. Knob reads are advisory; they never fail a caller's operation.
pub async fn knob_or(settings: &dyn RuntimeSettings, key: &str, default: i64) -> i64 {
    match settings.get_int(key).await {
        Ok(Some(v)) => v,
        Ok(None) => default,
        Err(e) => {
            tracing::debug!(key = key, error = %e, "runtime setting unavailable, using default");
            default
        }
    }
}

/// Base-room metadata lookup. Shards inherit the base room's flags.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn find_room(&self, base: &str) -> Result<Option<RoomInfo>, AppError>;
}

/// Persisted per-user profile state the presence broadcaster needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Flip the persisted online flag (first connection up / last one down).
    async fn set_online(&self, username: &str, online: bool) -> Result<(), AppError>;

    /// Persist a user's chosen presence and custom status text.
    async fn set_presence(
        &self,
        username: &str,
        status: PresenceStatus,
        status_text: Option<String>,
    ) -> Result<(), AppError>;

    async fn presence_of(&self, username: &str) -> Result<PresenceProfile, AppError>;
}
