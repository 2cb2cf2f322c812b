//! Room & Voice Roster Management
//!
//! Join/leave orchestration over the connection registry (directory flags,
//! bans, exemptions, autoscaled shard placement) plus the per-room voice
//! participant sets with insertion-time capacity enforcement.
//!
//! Every denial carries a short machine-readable reason string; every
//! roster broadcast carries the room name and the complete member list.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use uuid::Uuid;

use super::events::ServerEvent;
use super::registry::ConnectionRegistry;
use crate::config::LimitSettings;
use crate::domain::{
    knob_or, PermissionChecker, RoomDirectory, RoomInfo, RuntimeSettings, Sanctions,
};
use crate::shared::error::AppError;
use crate::shared::validation::{split_shard_suffix, valid_room_name};

/// Permissions that exempt a caller from individual room gates.
pub mod room_permission {
    pub const BYPASS_LOCK: &str = "room.bypass_lock";
    pub const BYPASS_INVITE: &str = "room.bypass_invite";
    pub const AGE_VERIFIED: &str = "room.age_verified";
}

/// A join that did not happen.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("join denied: {0}")]
    Denied(&'static str),

    #[error("room lookup failed: {0}")]
    Store(#[from] AppError),
}

impl JoinError {
    /// Reason string for the wire. Store failures fail closed and read as
    /// an unknown room to the caller.
    pub fn reason(&self) -> &'static str {
        match self {
            JoinError::Denied(reason) => reason,
            JoinError::Store(_) => "unknown_room",
        }
    }
}

/// Per-room voice participant sets. Entries appear on first join and
/// disappear when the last participant leaves.
#[derive(Default)]
pub struct VoiceRosterManager {
    rooms: DashMap<String, HashSet<String>>,
}

impl VoiceRosterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a user to a room's voice channel. `max_peers <= 0` means
    /// unlimited. A rejection never mutates the roster. Returns the
    /// complete roster after admission.
    pub fn join(&self, room: &str, username: &str, max_peers: i64) -> Result<Vec<String>, &'static str> {
        let mut set = self.rooms.entry(room.to_string()).or_default();
        if !set.contains(username) {
            if max_peers > 0 && (set.len() as i64) >= max_peers {
                return Err("voice_full");
            }
            set.insert(username.to_string());
        }
        let mut roster: Vec<String> = set.iter().cloned().collect();
        roster.sort();
        Ok(roster)
    }

    /// Remove a user from a room's voice channel. Returns true iff they
    /// were present. An emptied set is deleted.
    pub fn leave(&self, room: &str, username: &str) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(mut set) => set.remove(username),
            None => false,
        };
        if removed {
            self.rooms.remove_if(room, |_, set| set.is_empty());
        }
        removed
    }

    pub fn members(&self, room: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .rooms
            .get(room)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn contains(&self, room: &str, username: &str) -> bool {
        self.rooms
            .get(room)
            .map(|set| set.contains(username))
            .unwrap_or(false)
    }

    /// Administrative cap reduction: force-evict a random subset down to
    /// `new_cap`. Deliberately unordered; returns the evicted usernames.
    pub fn lower_cap(&self, room: &str, new_cap: usize) -> Vec<String> {
        let Some(mut set) = self.rooms.get_mut(room) else {
            return Vec::new();
        };
        if set.len() <= new_cap {
            return Vec::new();
        }

        let mut participants: Vec<String> = set.iter().cloned().collect();
        participants.shuffle(&mut rand::rng());
        let evicted: Vec<String> = participants.split_off(new_cap);
        for user in &evicted {
            set.remove(user);
        }
        drop(set);
        self.rooms.remove_if(room, |_, s| s.is_empty());
        evicted
    }
}

/// Join/leave orchestration and roster broadcasting.
pub struct RoomService {
    registry: Arc<ConnectionRegistry>,
    voice: Arc<VoiceRosterManager>,
    directory: Arc<dyn RoomDirectory>,
    sanctions: Arc<dyn Sanctions>,
    permissions: Arc<dyn PermissionChecker>,
    runtime: Arc<dyn RuntimeSettings>,
    /// Static defaults; capacity knobs are re-resolved on every check.
    limits: LimitSettings,
}

impl RoomService {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        voice: Arc<VoiceRosterManager>,
        directory: Arc<dyn RoomDirectory>,
        sanctions: Arc<dyn Sanctions>,
        permissions: Arc<dyn PermissionChecker>,
        runtime: Arc<dyn RuntimeSettings>,
        limits: LimitSettings,
    ) -> Self {
        Self {
            registry,
            voice,
            directory,
            sanctions,
            permissions,
            runtime,
            limits,
        }
    }

    /// Validate and perform a join, switching rooms implicitly when the
    /// caller was already somewhere else. Returns the room actually joined
    /// after shard selection.
    pub async fn join(
        &self,
        connection_id: Uuid,
        username: &str,
        requested: &str,
    ) -> Result<String, JoinError> {
        let (base, explicit_shard) = split_shard_suffix(requested);

        if !valid_room_name(base) {
            return Err(JoinError::Denied("bad_room_name"));
        }

        let info = self
            .directory
            .find_room(base)
            .await?
            .ok_or(JoinError::Denied("unknown_room"))?;

        if self.sanctions.is_room_banned(username, base).await? {
            return Err(JoinError::Denied("room_banned"));
        }
        if info.locked
            && !self
                .permissions
                .has_permission(username, room_permission::BYPASS_LOCK)
                .await?
        {
            return Err(JoinError::Denied("room_locked"));
        }
        if info.invite_only
            && !self
                .permissions
                .has_permission(username, room_permission::BYPASS_INVITE)
                .await?
        {
            return Err(JoinError::Denied("invite_only"));
        }
        if info.age_gated
            && !self
                .permissions
                .has_permission(username, room_permission::AGE_VERIFIED)
                .await?
        {
            return Err(JoinError::Denied("age_gated"));
        }

        let capacity = match info.capacity {
            Some(capacity) => capacity,
            None => knob_or(&*self.runtime, "room_capacity", self.limits.room_capacity).await,
        };
        let placement = self
            .registry
            .join_room(connection_id, base, explicit_shard, capacity)
            .ok_or(JoinError::Denied("not_connected"))?;

        if let Some(previous) = &placement.previous_room {
            if *previous != placement.room {
                self.after_room_exit(previous, username);
            }
        }
        self.broadcast_room_roster(&placement.room);

        tracing::debug!(username = username, room = %placement.room, "Room joined");
        Ok(placement.room)
    }

    /// Explicit leave. Returns the room left, if any.
    pub fn leave(&self, connection_id: Uuid, username: &str) -> Option<String> {
        let room = self.registry.leave_room(connection_id)?;
        self.after_room_exit(&room, username);
        Some(room)
    }

    /// Join the voice channel of the caller's current room.
    pub async fn voice_join(
        &self,
        connection_id: Uuid,
        username: &str,
    ) -> Result<String, &'static str> {
        let room = self
            .registry
            .current_room(connection_id)
            .ok_or("not_in_room")?;
        let max_peers = knob_or(&*self.runtime, "voice_max_peers", self.limits.voice_max_peers).await;
        self.voice.join(&room, username, max_peers)?;
        self.broadcast_voice_roster(&room);
        Ok(room)
    }

    /// Leave the voice channel of the caller's current room.
    pub fn voice_leave(&self, connection_id: Uuid, username: &str) -> Option<String> {
        let room = self.registry.current_room(connection_id)?;
        if self.voice.leave(&room, username) {
            self.broadcast_voice_left(&room, username);
            Some(room)
        } else {
            None
        }
    }

    /// Administrative voice cap reduction with eviction notices.
    pub fn lower_voice_cap(&self, room: &str, new_cap: usize) -> Vec<String> {
        let evicted = self.voice.lower_cap(room, new_cap);
        for username in &evicted {
            for sender in self.registry.senders_for_user(username) {
                let _ = sender.send(ServerEvent::VoiceEvicted {
                    room: room.to_string(),
                });
            }
        }
        if !evicted.is_empty() {
            self.broadcast_voice_roster(room);
        }
        evicted
    }

    /// Room metadata for the message path (slowmode interval).
    pub async fn room_info(&self, room: &str) -> Result<Option<RoomInfo>, AppError> {
        let (base, _) = split_shard_suffix(room);
        self.directory.find_room(base).await
    }

    /// Cleanup after a user's connection exits a room, whether by explicit
    /// leave, room switch, or disconnect.
    pub fn after_room_exit(&self, room: &str, username: &str) {
        self.broadcast_room_roster(room);
        // Voice membership only survives while some connection of the user
        // is still in the room.
        if !self.registry.members(room).contains(&username.to_string())
            && self.voice.leave(room, username)
        {
            self.broadcast_voice_left(room, username);
        }
    }

    pub fn broadcast_room_roster(&self, room: &str) {
        let event = ServerEvent::RoomRoster {
            room: room.to_string(),
            members: self.registry.members(room),
        };
        for sender in self.registry.senders_in_room(room) {
            let _ = sender.send(event.clone());
        }
    }

    fn broadcast_voice_roster(&self, room: &str) {
        let event = ServerEvent::VoiceRoster {
            room: room.to_string(),
            members: self.voice.members(room),
        };
        for sender in self.registry.senders_in_room(room) {
            let _ = sender.send(event.clone());
        }
    }

    fn broadcast_voice_left(&self, room: &str, username: &str) {
        let left = ServerEvent::VoiceLeft {
            room: room.to_string(),
            username: username.to_string(),
        };
        for sender in self.registry.senders_in_room(room) {
            let _ = sender.send(left.clone());
        }
        self.broadcast_voice_roster(room);
    }
}
