//! Ephemeral Signaling Sessions
//!
//! 1:1 voice calls and P2P file transfers as small finite state machines
//! keyed by a caller-supplied session id: offered, then active, then gone
//! (declined, ended, or expired). Terminal states are not stored; the entry
//! is removed.
//!
//! Only the two named participants may transition a session. Any request
//! from anyone else gets the same answer as a nonexistent session, so
//! session ids cannot be probed.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use super::events::SignalKindTag;

/// What a signaling sub-protocol is carrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Call,
    FileTransfer,
}

impl From<SignalKindTag> for SignalKind {
    fn from(tag: SignalKindTag) -> Self {
        match tag {
            SignalKindTag::Call => Self::Call,
            SignalKindTag::FileTransfer => Self::FileTransfer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalState {
    Offered,
    Active,
}

#[derive(Debug, Clone)]
struct SignalSession {
    kind: SignalKind,
    initiator: String,
    peer: String,
    state: SignalState,
    last_update: DateTime<Utc>,
}

/// Uniform rejection for anything the caller may not see or do. A missing
/// session and a foreign session are indistinguishable on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotVisible;

/// Outcome of a successful transition: who to relay to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    pub to: String,
}

pub struct SignalingTable {
    sessions: DashMap<String, SignalSession>,
    offer_ttl_seconds: i64,
    active_ttl_seconds: i64,
}

impl SignalingTable {
    pub fn new(offer_ttl_seconds: i64, active_ttl_seconds: i64) -> Self {
        Self {
            sessions: DashMap::new(),
            offer_ttl_seconds,
            active_ttl_seconds,
        }
    }

    /// Create a session in the offered state. Fails if the id is taken.
    pub fn offer(
        &self,
        session_id: &str,
        kind: SignalKind,
        initiator: &str,
        peer: &str,
    ) -> Result<Relay, NotVisible> {
        self.offer_at(session_id, kind, initiator, peer, Utc::now())
    }

    pub fn offer_at(
        &self,
        session_id: &str,
        kind: SignalKind,
        initiator: &str,
        peer: &str,
        now: DateTime<Utc>,
    ) -> Result<Relay, NotVisible> {
        self.sweep_kind(kind, now);

        let mut claimed = false;
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                claimed = true;
                SignalSession {
                    kind,
                    initiator: initiator.to_string(),
                    peer: peer.to_string(),
                    state: SignalState::Offered,
                    last_update: now,
                }
            });

        if claimed {
            Ok(Relay {
                to: peer.to_string(),
            })
        } else {
            Err(NotVisible)
        }
    }

    /// Peer accepts; the session becomes active.
    pub fn answer(&self, session_id: &str, caller: &str) -> Result<Relay, NotVisible> {
        self.answer_at(session_id, caller, Utc::now())
    }

    pub fn answer_at(
        &self,
        session_id: &str,
        caller: &str,
        now: DateTime<Utc>,
    ) -> Result<Relay, NotVisible> {
        let mut session = self.live_session(session_id, caller, now)?;
        // Only the offered peer can accept, and only once.
        if session.state != SignalState::Offered || session.peer != caller {
            return Err(NotVisible);
        }
        session.state = SignalState::Active;
        session.last_update = now;
        Ok(Relay {
            to: session.initiator.clone(),
        })
    }

    /// Relay an ICE candidate to the other participant.
    pub fn ice(&self, session_id: &str, caller: &str) -> Result<Relay, NotVisible> {
        self.ice_at(session_id, caller, Utc::now())
    }

    pub fn ice_at(
        &self,
        session_id: &str,
        caller: &str,
        now: DateTime<Utc>,
    ) -> Result<Relay, NotVisible> {
        let mut session = self.live_session(session_id, caller, now)?;
        session.last_update = now;
        Ok(Relay {
            to: counterparty(&session, caller),
        })
    }

    /// Peer declines an offered session (terminal).
    pub fn decline(&self, session_id: &str, caller: &str) -> Result<Relay, NotVisible> {
        self.decline_at(session_id, caller, Utc::now())
    }

    pub fn decline_at(
        &self,
        session_id: &str,
        caller: &str,
        now: DateTime<Utc>,
    ) -> Result<Relay, NotVisible> {
        let relay = {
            let session = self.live_session(session_id, caller, now)?;
            if session.state != SignalState::Offered || session.peer != caller {
                return Err(NotVisible);
            }
            Relay {
                to: session.initiator.clone(),
            }
        };
        self.sessions.remove(session_id);
        Ok(relay)
    }

    /// Either participant ends the session (terminal).
    pub fn end(&self, session_id: &str, caller: &str) -> Result<Relay, NotVisible> {
        self.end_at(session_id, caller, Utc::now())
    }

    pub fn end_at(
        &self,
        session_id: &str,
        caller: &str,
        now: DateTime<Utc>,
    ) -> Result<Relay, NotVisible> {
        let relay = {
            let session = self.live_session(session_id, caller, now)?;
            Relay {
                to: counterparty(&session, caller),
            }
        };
        self.sessions.remove(session_id);
        Ok(relay)
    }

    /// End every session a disconnecting user participates in, returning
    /// the counterparties to notify.
    pub fn end_all_for(&self, username: &str) -> Vec<(String, String)> {
        let ended: Vec<(String, String)> = self
            .sessions
            .iter()
            .filter(|entry| entry.initiator == username || entry.peer == username)
            .map(|entry| {
                (
                    entry.key().clone(),
                    counterparty(entry.value(), username),
                )
            })
            .collect();
        for (session_id, _) in &ended {
            self.sessions.remove(session_id);
        }
        ended
    }

    /// Fetch a live session the caller participates in, expiring it lazily
    /// if its TTL has lapsed.
    fn live_session<'a>(
        &'a self,
        session_id: &str,
        caller: &str,
        now: DateTime<Utc>,
    ) -> Result<dashmap::mapref::one::RefMut<'a, String, SignalSession>, NotVisible> {
        if let Some(session) = self.sessions.get(session_id) {
            if self.is_expired(&session, now) {
                drop(session);
                self.sessions.remove(session_id);
                return Err(NotVisible);
            }
        }

        let session = self.sessions.get_mut(session_id).ok_or(NotVisible)?;
        if session.initiator != caller && session.peer != caller {
            return Err(NotVisible);
        }
        Ok(session)
    }

    fn is_expired(&self, session: &SignalSession, now: DateTime<Utc>) -> bool {
        let ttl = match session.state {
            SignalState::Offered => self.offer_ttl_seconds,
            SignalState::Active => self.active_ttl_seconds,
        };
        now - session.last_update > Duration::seconds(ttl)
    }

    /// Drop expired sessions of one kind. Runs before any new request of
    /// that kind so stale ids cannot block reuse.
    fn sweep_kind(&self, kind: SignalKind, now: DateTime<Utc>) {
        self.sessions
            .retain(|_, session| session.kind != kind || !self.is_expired_raw(session, now));
    }

    fn is_expired_raw(&self, session: &SignalSession, now: DateTime<Utc>) -> bool {
        self.is_expired(session, now)
    }
}

fn counterparty(session: &SignalSession, caller: &str) -> String {
    if session.initiator == caller {
        session.peer.clone()
    } else {
        session.initiator.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table() -> SignalingTable {
        SignalingTable::new(45, 600)
    }

    #[test]
    fn offer_answer_ice_end_happy_path() {
        let table = table();
        let now = Utc::now();

        let relay = table
            .offer_at("s1", SignalKind::Call, "alice", "bob", now)
            .unwrap();
        assert_eq!(relay.to, "bob");

        let relay = table.answer_at("s1", "bob", now).unwrap();
        assert_eq!(relay.to, "alice");

        assert_eq!(table.ice_at("s1", "alice", now).unwrap().to, "bob");
        assert_eq!(table.ice_at("s1", "bob", now).unwrap().to, "alice");

        assert_eq!(table.end_at("s1", "alice", now).unwrap().to, "bob");
        // Terminal: the id is gone.
        assert_eq!(table.ice_at("s1", "alice", now), Err(NotVisible));
    }

    #[test]
    fn non_participants_cannot_probe_session_ids() {
        let table = table();
        let now = Utc::now();
        table
            .offer_at("s1", SignalKind::Call, "alice", "bob", now)
            .unwrap();

        // Existing-but-foreign and nonexistent look identical.
        assert_eq!(table.answer_at("s1", "mallory", now), Err(NotVisible));
        assert_eq!(table.ice_at("s1", "mallory", now), Err(NotVisible));
        assert_eq!(table.end_at("s1", "mallory", now), Err(NotVisible));
        assert_eq!(table.end_at("missing", "mallory", now), Err(NotVisible));
    }

    #[test]
    fn only_the_offered_peer_may_answer_or_decline() {
        let table = table();
        let now = Utc::now();
        table
            .offer_at("s1", SignalKind::Call, "alice", "bob", now)
            .unwrap();

        // The initiator cannot accept their own offer.
        assert_eq!(table.answer_at("s1", "alice", now), Err(NotVisible));

        let relay = table.decline_at("s1", "bob", now).unwrap();
        assert_eq!(relay.to, "alice");
        assert_eq!(table.answer_at("s1", "bob", now), Err(NotVisible));
    }

    #[test]
    fn duplicate_session_id_is_rejected() {
        let table = table();
        let now = Utc::now();
        table
            .offer_at("s1", SignalKind::Call, "alice", "bob", now)
            .unwrap();
        assert_eq!(
            table.offer_at("s1", SignalKind::Call, "carol", "dave", now),
            Err(NotVisible)
        );
    }

    #[test]
    fn offered_sessions_expire_on_the_short_ttl() {
        let table = table();
        let now = Utc::now();
        table
            .offer_at("s1", SignalKind::Call, "alice", "bob", now)
            .unwrap();

        let later = now + Duration::seconds(46);
        assert_eq!(table.answer_at("s1", "bob", later), Err(NotVisible));
        // The id is reusable after expiry.
        assert!(table
            .offer_at("s1", SignalKind::Call, "alice", "bob", later)
            .is_ok());
    }

    #[test]
    fn active_sessions_live_on_the_long_ttl() {
        let table = table();
        let now = Utc::now();
        table
            .offer_at("s1", SignalKind::Call, "alice", "bob", now)
            .unwrap();
        table.answer_at("s1", "bob", now).unwrap();

        // Well past the offer TTL, inside the active TTL.
        let later = now + Duration::seconds(300);
        assert!(table.ice_at("s1", "alice", later).is_ok());

        let expired = later + Duration::seconds(601);
        assert_eq!(table.ice_at("s1", "alice", expired), Err(NotVisible));
    }

    #[test]
    fn ice_activity_extends_the_session() {
        let table = table();
        let now = Utc::now();
        table
            .offer_at("s1", SignalKind::FileTransfer, "alice", "bob", now)
            .unwrap();
        table.answer_at("s1", "bob", now).unwrap();

        let mut t = now;
        for _ in 0..5 {
            t += Duration::seconds(500);
            assert!(table.ice_at("s1", "bob", t).is_ok());
        }
    }

    #[test]
    fn sweep_only_touches_the_requested_kind() {
        let table = table();
        let now = Utc::now();
        table
            .offer_at("call", SignalKind::Call, "alice", "bob", now)
            .unwrap();
        table
            .offer_at("xfer", SignalKind::FileTransfer, "alice", "bob", now)
            .unwrap();

        // A new call offer past the TTL sweeps stale calls, not transfers.
        let later = now + Duration::seconds(46);
        table
            .offer_at("call2", SignalKind::Call, "carol", "dave", later)
            .unwrap();

        assert!(table.sessions.get("call").is_none());
        assert!(table.sessions.get("xfer").is_some());
    }

    #[test]
    fn disconnect_ends_every_session_of_the_user() {
        let table = table();
        let now = Utc::now();
        table
            .offer_at("s1", SignalKind::Call, "alice", "bob", now)
            .unwrap();
        table
            .offer_at("s2", SignalKind::FileTransfer, "carol", "alice", now)
            .unwrap();
        table
            .offer_at("s3", SignalKind::Call, "carol", "dave", now)
            .unwrap();

        let mut ended = table.end_all_for("alice");
        ended.sort();
        assert_eq!(
            ended,
            vec![
                ("s1".to_string(), "bob".to_string()),
                ("s2".to_string(), "carol".to_string()),
            ]
        );
        assert!(table.sessions.get("s3").is_some());
    }
}
