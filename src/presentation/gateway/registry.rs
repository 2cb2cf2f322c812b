//! Connection Registry
//!
//! Process-local map from live connection id to {username, current room,
//! outbound sender}. Authoritative only for this process and rebuilt from
//! zero on restart.
//!
//! Occupancy is always derived from the live set (distinct usernames whose
//! entry points at the room), never maintained as a counter; counters drift
//! under multi-tab clients and out-of-order disconnects. Shard selection
//! and room placement happen under one lock acquisition, so two concurrent
//! joins cannot both claim the last slot of a room or both create the same
//! shard.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::events::ServerEvent;
use crate::shared::validation::shard_name;

/// One live persistent connection.
struct ConnectionEntry {
    username: String,
    current_room: Option<String>,
    sender: UnboundedSender<ServerEvent>,
}

/// Result of removing a connection.
#[derive(Debug)]
pub struct RemovedConnection {
    pub username: String,
    pub room: Option<String>,
    /// True iff the user has no remaining live connections.
    pub last_for_user: bool,
}

/// Result of placing a connection into a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPlacement {
    /// The room actually joined (base or selected shard).
    pub room: String,
    /// The room implicitly left, if any.
    pub previous_room: Option<String>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<Uuid, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns true iff this is the user's first
    /// live connection (the online-flag flip belongs to the caller).
    pub fn register(
        &self,
        connection_id: Uuid,
        username: &str,
        sender: UnboundedSender<ServerEvent>,
    ) -> bool {
        let mut map = self.inner.lock();
        let first = !map.values().any(|e| e.username == username);
        map.insert(
            connection_id,
            ConnectionEntry {
                username: username.to_string(),
                current_room: None,
                sender,
            },
        );
        first
    }

    /// Remove a connection, reporting what was torn down.
    pub fn remove(&self, connection_id: Uuid) -> Option<RemovedConnection> {
        let mut map = self.inner.lock();
        let entry = map.remove(&connection_id)?;
        let last = !map.values().any(|e| e.username == entry.username);
        Some(RemovedConnection {
            username: entry.username,
            room: entry.current_room,
            last_for_user: last,
        })
    }

    pub fn username_of(&self, connection_id: Uuid) -> Option<String> {
        self.inner
            .lock()
            .get(&connection_id)
            .map(|e| e.username.clone())
    }

    pub fn current_room(&self, connection_id: Uuid) -> Option<String> {
        self.inner
            .lock()
            .get(&connection_id)
            .and_then(|e| e.current_room.clone())
    }

    /// Clear a connection's room pointer, returning the room it was in.
    pub fn leave_room(&self, connection_id: Uuid) -> Option<String> {
        self.inner
            .lock()
            .get_mut(&connection_id)?
            .current_room
            .take()
    }

    /// Place a connection into a room, running autoscaled shard selection
    /// when no explicit shard was requested. The whole decision happens
    /// under one lock so concurrent joins serialize.
    ///
    /// `capacity <= 0` means unlimited. A user already counted in the
    /// target room (another tab) never competes against themselves for the
    /// last slot.
    pub fn join_room(
        &self,
        connection_id: Uuid,
        base: &str,
        explicit_shard: Option<u32>,
        capacity: i64,
    ) -> Option<JoinPlacement> {
        let mut map = self.inner.lock();
        let username = map.get(&connection_id)?.username.clone();

        let target = match explicit_shard {
            Some(n) => shard_name(base, n),
            None => {
                if capacity <= 0 || occupancy_excluding(&map, base, &username) < capacity {
                    base.to_string()
                } else {
                    // Lowest-indexed shard with room; an empty (not yet
                    // existing) shard qualifies, so the scan terminates.
                    let mut n = 2u32;
                    loop {
                        let candidate = shard_name(base, n);
                        if occupancy_excluding(&map, &candidate, &username) < capacity {
                            break candidate;
                        }
                        n += 1;
                    }
                }
            }
        };

        let entry = map.get_mut(&connection_id)?;
        let previous = entry.current_room.replace(target.clone());
        Some(JoinPlacement {
            room: target,
            previous_room: previous,
        })
    }

    /// Distinct usernames currently in a room, sorted for stable snapshots.
    pub fn members(&self, room: &str) -> Vec<String> {
        let map = self.inner.lock();
        let mut members: Vec<String> = map
            .values()
            .filter(|e| e.current_room.as_deref() == Some(room))
            .map(|e| e.username.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        members.sort();
        members
    }

    pub fn occupancy(&self, room: &str) -> i64 {
        let map = self.inner.lock();
        map.values()
            .filter(|e| e.current_room.as_deref() == Some(room))
            .map(|e| e.username.as_str())
            .collect::<HashSet<_>>()
            .len() as i64
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.inner.lock().values().any(|e| e.username == username)
    }

    /// Snapshot the outbound senders of a user's live connections. The
    /// caller sends after the lock is released.
    pub fn senders_for_user(&self, username: &str) -> Vec<UnboundedSender<ServerEvent>> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.username == username)
            .map(|e| e.sender.clone())
            .collect()
    }

    /// Snapshot the outbound senders of every connection in a room.
    pub fn senders_in_room(&self, room: &str) -> Vec<UnboundedSender<ServerEvent>> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.current_room.as_deref() == Some(room))
            .map(|e| e.sender.clone())
            .collect()
    }
}

fn occupancy_excluding(
    map: &HashMap<Uuid, ConnectionEntry>,
    room: &str,
    exclude: &str,
) -> i64 {
    map.values()
        .filter(|e| e.current_room.as_deref() == Some(room) && e.username != exclude)
        .map(|e| e.username.as_str())
        .collect::<HashSet<_>>()
        .len() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::unbounded_channel;

    fn connect(registry: &ConnectionRegistry, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        let (tx, _rx) = unbounded_channel();
        registry.register(id, username, tx);
        id
    }

    fn join(registry: &ConnectionRegistry, id: Uuid, room: &str, capacity: i64) -> String {
        registry.join_room(id, room, None, capacity).unwrap().room
    }

    #[test]
    fn first_and_last_connection_flags() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = unbounded_channel();
        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();

        assert!(registry.register(a1, "alice", tx.clone()));
        assert!(!registry.register(a2, "alice", tx));

        assert!(!registry.remove(a1).unwrap().last_for_user);
        assert!(registry.remove(a2).unwrap().last_for_user);
        assert!(!registry.is_online("alice"));
    }

    #[test]
    fn occupancy_counts_distinct_users_not_connections() {
        let registry = ConnectionRegistry::new();
        let tab1 = connect(&registry, "alice");
        let tab2 = connect(&registry, "alice");
        let bob = connect(&registry, "bob");

        join(&registry, tab1, "Lobby", 0);
        join(&registry, tab2, "Lobby", 0);
        join(&registry, bob, "Lobby", 0);

        assert_eq!(registry.occupancy("Lobby"), 2);
        assert_eq!(registry.members("Lobby"), vec!["alice", "bob"]);
    }

    #[test]
    fn join_switches_rooms_and_reports_the_old_one() {
        let registry = ConnectionRegistry::new();
        let id = connect(&registry, "alice");

        let placement = registry.join_room(id, "Lobby", None, 0).unwrap();
        assert_eq!(placement.previous_room, None);

        let placement = registry.join_room(id, "Dev", None, 0).unwrap();
        assert_eq!(placement.previous_room.as_deref(), Some("Lobby"));
        assert_eq!(registry.occupancy("Lobby"), 0);
        assert_eq!(registry.occupancy("Dev"), 1);
    }

    #[test]
    fn base_room_fills_before_a_shard_is_created() {
        let registry = ConnectionRegistry::new();
        for name in ["a", "b", "c"] {
            let id = connect(&registry, name);
            assert_eq!(join(&registry, id, "Lobby", 3), "Lobby");
        }

        let id = connect(&registry, "d");
        assert_eq!(join(&registry, id, "Lobby", 3), "Lobby (2)");
    }

    #[test]
    fn shard_scan_picks_the_lowest_index_with_room() {
        let registry = ConnectionRegistry::new();
        // Fill the base and shard 2; leave a hole in shard 2 afterwards.
        for name in ["a", "b"] {
            let id = connect(&registry, name);
            join(&registry, id, "Lobby", 2);
        }
        let c = connect(&registry, "c");
        let d = connect(&registry, "d");
        assert_eq!(join(&registry, c, "Lobby", 2), "Lobby (2)");
        assert_eq!(join(&registry, d, "Lobby", 2), "Lobby (2)");

        let e = connect(&registry, "e");
        assert_eq!(join(&registry, e, "Lobby", 2), "Lobby (3)");

        // A slot opens in shard 2; the next join takes it, not shard 3.
        registry.leave_room(c);
        let f = connect(&registry, "f");
        assert_eq!(join(&registry, f, "Lobby", 2), "Lobby (2)");
    }

    #[test]
    fn concurrent_joins_on_the_last_slot_split_across_shards() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(ConnectionRegistry::new());
        let filler = connect(&registry, "filler");
        join(&registry, filler, "Lobby", 2);

        let a = connect(&registry, "alice");
        let b = connect(&registry, "bob");

        let handles: Vec<_> = [a, b]
            .into_iter()
            .map(|id| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.join_room(id, "Lobby", None, 2).unwrap().room)
            })
            .collect();

        let mut rooms: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        rooms.sort();

        // Exactly one lands in the base, the other in shard 2.
        assert_eq!(rooms, vec!["Lobby", "Lobby (2)"]);
        assert_eq!(registry.occupancy("Lobby"), 2);
        assert_eq!(registry.occupancy("Lobby (2)"), 1);
    }

    #[test]
    fn explicit_shard_is_honored_verbatim() {
        let registry = ConnectionRegistry::new();
        let id = connect(&registry, "alice");
        let placement = registry.join_room(id, "Lobby", Some(4), 2).unwrap();
        assert_eq!(placement.room, "Lobby (4)");
    }

    #[test]
    fn a_multi_tab_user_never_competes_with_themselves() {
        let registry = ConnectionRegistry::new();
        let tab1 = connect(&registry, "alice");
        let bob = connect(&registry, "bob");
        join(&registry, tab1, "Lobby", 2);
        join(&registry, bob, "Lobby", 2);

        // Room is at capacity, but alice is already one of the two.
        let tab2 = connect(&registry, "alice");
        assert_eq!(join(&registry, tab2, "Lobby", 2), "Lobby");
    }

    #[test]
    fn senders_snapshot_reaches_every_room_connection() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(a, "alice", tx_a);
        registry.register(b, "bob", tx_b);
        registry.join_room(a, "Lobby", None, 0);
        registry.join_room(b, "Lobby", None, 0);

        for sender in registry.senders_in_room("Lobby") {
            let _ = sender.send(ServerEvent::Pong);
        }

        assert!(matches!(rx_a.try_recv(), Ok(ServerEvent::Pong)));
        assert!(matches!(rx_b.try_recv(), Ok(ServerEvent::Pong)));
    }
}
