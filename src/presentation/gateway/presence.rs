//! Presence Broadcaster
//!
//! Computes viewer-safe presence snapshots and pushes them to the friends
//! of a user whenever their online state, chosen presence, or status text
//! changes. Delivery is best-effort: a friend with no live connection, a
//! full channel, or a failing friends lookup never blocks or fails the
//! transition that triggered the broadcast.

use std::sync::Arc;

use super::events::ServerEvent;
use super::registry::ConnectionRegistry;
use crate::domain::{FriendsProvider, PresenceProfile, PresenceStatus, ProfileStore};
use crate::shared::error::AppError;

/// What friends are allowed to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub online: bool,
    pub presence: &'static str,
    pub status_text: Option<String>,
}

/// Invisible users always read as offline with no status text, regardless
/// of true connectivity.
pub fn viewer_safe_snapshot(connected: bool, profile: &PresenceProfile) -> PresenceSnapshot {
    if profile.status == PresenceStatus::Invisible {
        return PresenceSnapshot {
            online: false,
            presence: "offline",
            status_text: None,
        };
    }
    PresenceSnapshot {
        online: connected,
        presence: if connected {
            profile.status.as_str()
        } else {
            "offline"
        },
        status_text: profile.status_text.clone(),
    }
}

pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
    friends: Arc<dyn FriendsProvider>,
    profiles: Arc<dyn ProfileStore>,
}

impl PresenceBroadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        friends: Arc<dyn FriendsProvider>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            registry,
            friends,
            profiles,
        }
    }

    /// Persist the online flag (first connection up, last one down) and
    /// fan the resulting snapshot out to friends.
    pub async fn online_changed(&self, username: &str, online: bool) {
        if let Err(e) = self.profiles.set_online(username, online).await {
            tracing::warn!(username = username, error = %e, "Failed to persist online flag");
        }
        self.broadcast(username).await;
    }

    /// Fan out the current snapshot of a user to their connected friends.
    /// Swallows every failure by design.
    pub async fn broadcast(&self, username: &str) {
        let snapshot = match self.snapshot_of(username).await {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(username = username, error = %e, "Presence snapshot unavailable");
                return;
            }
        };

        let friends = match self.friends.friends_of(username).await {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(username = username, error = %e, "Friends list unavailable");
                return;
            }
        };

        let event = ServerEvent::Presence {
            username: username.to_string(),
            online: snapshot.online,
            presence: snapshot.presence.to_string(),
            status_text: snapshot.status_text,
        };

        for friend in friends {
            for sender in self.registry.senders_for_user(&friend) {
                let _ = sender.send(event.clone());
            }
        }
    }

    async fn snapshot_of(&self, username: &str) -> Result<PresenceSnapshot, AppError> {
        let profile = self.profiles.presence_of(username).await?;
        let connected = self.registry.is_online(username);
        Ok(viewer_safe_snapshot(connected, &profile))
    }
}
