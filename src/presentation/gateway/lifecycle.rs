//! Connection Lifecycle
//!
//! Connect and disconnect orchestration: sanction gating on the way in,
//! room/voice/signaling teardown and presence transitions on the way out.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::events::ServerEvent;
use super::presence::PresenceBroadcaster;
use super::registry::ConnectionRegistry;
use super::rooms::RoomService;
use super::signaling::SignalingTable;
use crate::domain::{SanctionKind, Sanctions};

pub struct ConnectionLifecycle {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomService>,
    signaling: Arc<SignalingTable>,
    presence: Arc<PresenceBroadcaster>,
    sanctions: Arc<dyn Sanctions>,
}

impl ConnectionLifecycle {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomService>,
        signaling: Arc<SignalingTable>,
        presence: Arc<PresenceBroadcaster>,
        sanctions: Arc<dyn Sanctions>,
    ) -> Self {
        Self {
            registry,
            rooms,
            signaling,
            presence,
            sanctions,
        }
    }

    /// Admit or reject a freshly authenticated connection. Bans and kicks
    /// close the connection before it is ever registered; a sanction-store
    /// failure fails closed.
    pub async fn on_connect(
        &self,
        connection_id: Uuid,
        username: &str,
        sender: UnboundedSender<ServerEvent>,
    ) -> Result<(), &'static str> {
        let banned = self
            .sanctions
            .is_sanctioned(username, SanctionKind::Ban)
            .await
            .unwrap_or(true);
        if banned {
            return Err("banned");
        }
        let kicked = self
            .sanctions
            .is_sanctioned(username, SanctionKind::Kick)
            .await
            .unwrap_or(true);
        if kicked {
            return Err("kicked");
        }

        let first = self.registry.register(connection_id, username, sender);
        if first {
            self.presence.online_changed(username, true).await;
        }

        tracing::info!(username = username, connection_id = %connection_id, "Gateway connection up");
        Ok(())
    }

    /// Tear down everything a vanished connection was holding.
    pub async fn on_disconnect(&self, connection_id: Uuid) {
        let Some(removed) = self.registry.remove(connection_id) else {
            return;
        };

        if let Some(room) = &removed.room {
            self.rooms.after_room_exit(room, &removed.username);
        }

        if removed.last_for_user {
            // Signaling sessions follow the user, not the connection, but
            // with no connection left there is nobody to signal through.
            for (session_id, counterparty) in self.signaling.end_all_for(&removed.username) {
                for sender in self.registry.senders_for_user(&counterparty) {
                    let _ = sender.send(ServerEvent::Signal {
                        session_id: session_id.clone(),
                        from: removed.username.clone(),
                        event: "end",
                        payload: serde_json::Value::Null,
                    });
                }
            }

            self.presence.online_changed(&removed.username, false).await;
        }

        tracing::info!(username = %removed.username, connection_id = %connection_id, "Gateway connection down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::rooms::VoiceRosterManager;
    use super::super::signaling::SignalKind;
    use crate::config::LimitSettings;
    use crate::domain::ports::{
        MockFriendsProvider, MockPermissionChecker, MockProfileStore, MockRoomDirectory,
        MockRuntimeSettings, MockSanctions,
    };
    use crate::domain::RoomInfo;
    use crate::shared::error::AppError;
    use tokio::sync::mpsc::unbounded_channel;

    fn limits() -> LimitSettings {
        LimitSettings {
            room_msg_limit: 20,
            room_msg_window_seconds: 10,
            strikes_before_mute: 5,
            strike_window_seconds: 300,
            auto_mute_minutes: 10,
            room_capacity: 50,
            voice_max_peers: 12,
            max_urls_per_message: 4,
            max_mentions_per_message: 8,
            dup_msg_max: 3,
            dup_msg_window_seconds: 60,
            dup_msg_min_len: 16,
            signal_offer_ttl_seconds: 45,
            signal_active_ttl_seconds: 600,
        }
    }

    struct Fixture {
        lifecycle: ConnectionLifecycle,
        registry: Arc<ConnectionRegistry>,
        signaling: Arc<SignalingTable>,
    }

    fn fixture(sanctions: MockSanctions) -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let signaling = Arc::new(SignalingTable::new(45, 600));
        let sanctions: Arc<dyn Sanctions> = Arc::new(sanctions);

        let mut directory = MockRoomDirectory::new();
        directory
            .expect_find_room()
            .returning(|_| Ok(Some(RoomInfo::default())));
        let mut permissions = MockPermissionChecker::new();
        permissions.expect_has_permission().returning(|_, _| Ok(false));
        let mut runtime = MockRuntimeSettings::new();
        runtime.expect_get_int().returning(|_| Ok(None));

        let rooms = Arc::new(RoomService::new(
            registry.clone(),
            Arc::new(VoiceRosterManager::new()),
            Arc::new(directory),
            sanctions.clone(),
            Arc::new(permissions),
            Arc::new(runtime),
            limits(),
        ));

        let mut friends = MockFriendsProvider::new();
        friends.expect_friends_of().returning(|_| Ok(vec![]));
        let mut profiles = MockProfileStore::new();
        profiles.expect_set_online().returning(|_, _| Ok(()));
        profiles
            .expect_presence_of()
            .returning(|_| Ok(Default::default()));
        let presence = Arc::new(PresenceBroadcaster::new(
            registry.clone(),
            Arc::new(friends),
            Arc::new(profiles),
        ));

        Fixture {
            lifecycle: ConnectionLifecycle::new(
                registry.clone(),
                rooms,
                signaling.clone(),
                presence,
                sanctions,
            ),
            registry,
            signaling,
        }
    }

    fn lenient_sanctions() -> MockSanctions {
        let mut sanctions = MockSanctions::new();
        sanctions.expect_is_sanctioned().returning(|_, _| Ok(false));
        sanctions.expect_is_room_banned().returning(|_, _| Ok(false));
        sanctions
    }

    #[tokio::test]
    async fn banned_users_are_rejected_before_registration() {
        let mut sanctions = MockSanctions::new();
        sanctions
            .expect_is_sanctioned()
            .withf(|_, kind| *kind == SanctionKind::Ban)
            .returning(|_, _| Ok(true));
        let f = fixture(sanctions);

        let (tx, _rx) = unbounded_channel();
        let err = f
            .lifecycle
            .on_connect(Uuid::new_v4(), "alice", tx)
            .await
            .unwrap_err();
        assert_eq!(err, "banned");
        assert!(!f.registry.is_online("alice"));
    }

    #[tokio::test]
    async fn sanction_store_failure_fails_closed() {
        let mut sanctions = MockSanctions::new();
        sanctions
            .expect_is_sanctioned()
            .returning(|_, _| Err(AppError::Internal("down".into())));
        let f = fixture(sanctions);

        let (tx, _rx) = unbounded_channel();
        assert!(f
            .lifecycle
            .on_connect(Uuid::new_v4(), "alice", tx)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn disconnect_ends_signaling_and_notifies_counterparties() {
        let f = fixture(lenient_sanctions());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (tx_a, _rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        f.lifecycle.on_connect(alice, "alice", tx_a).await.unwrap();
        f.lifecycle.on_connect(bob, "bob", tx_b).await.unwrap();

        f.signaling
            .offer("s1", SignalKind::Call, "alice", "bob")
            .unwrap();

        f.lifecycle.on_disconnect(alice).await;

        let mut saw_end = false;
        while let Ok(event) = rx_b.try_recv() {
            if let ServerEvent::Signal { event: "end", from, .. } = event {
                assert_eq!(from, "alice");
                saw_end = true;
            }
        }
        assert!(saw_end);
        assert!(!f.registry.is_online("alice"));
    }

    #[tokio::test]
    async fn multi_tab_disconnect_keeps_sessions_until_the_last_tab() {
        let f = fixture(lenient_sanctions());
        let tab1 = Uuid::new_v4();
        let tab2 = Uuid::new_v4();
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        f.lifecycle.on_connect(tab1, "alice", tx1).await.unwrap();
        f.lifecycle.on_connect(tab2, "alice", tx2).await.unwrap();

        f.signaling
            .offer("s1", SignalKind::Call, "alice", "bob")
            .unwrap();

        f.lifecycle.on_disconnect(tab1).await;
        assert!(f.registry.is_online("alice"));
        assert!(f.signaling.end_all_for("alice").len() == 1);
    }
}
