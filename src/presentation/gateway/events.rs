//! Gateway Wire Events
//!
//! JSON event contract for the persistent connection. Inbound frames carry
//! an `op` string plus a data object; outbound frames a `t` tag plus data.
//! Rosters and presence snapshots are always complete, never incremental.

use serde::{Deserialize, Serialize};

/// Client-to-server frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join (or switch to) a room.
    Join { room: String },
    /// Leave the current room.
    Leave,
    /// Room text message. `encrypted` payloads skip the plaintext heuristics.
    Msg {
        text: String,
        #[serde(default)]
        encrypted: bool,
    },
    /// Join the current room's voice channel.
    VoiceJoin,
    /// Leave the current room's voice channel.
    VoiceLeave,
    /// Start a 1:1 call or file transfer.
    Offer {
        session_id: String,
        to: String,
        kind: SignalKindTag,
        payload: serde_json::Value,
    },
    /// Accept an offered session.
    Answer {
        session_id: String,
        payload: serde_json::Value,
    },
    /// Relay an ICE candidate within a session.
    Ice {
        session_id: String,
        payload: serde_json::Value,
    },
    /// Decline an offered session (terminal).
    Decline { session_id: String },
    /// End a session from either side (terminal).
    End { session_id: String },
    /// Change chosen presence and/or status text.
    Presence {
        presence: String,
        #[serde(default)]
        status_text: Option<String>,
    },
    /// Explicit "I am active" ping; the only idle-window extender.
    Activity,
    Ping,
}

/// Signal session kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKindTag {
    Call,
    FileTransfer,
}

/// Server-to-client frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", content = "d", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent immediately after a successful identify.
    Ready { username: String },
    /// Complete member list of a room, recomputed per broadcast.
    RoomRoster { room: String, members: Vec<String> },
    /// Complete voice participant list of a room.
    VoiceRoster { room: String, members: Vec<String> },
    /// A user left a room's voice channel.
    VoiceLeft { room: String, username: String },
    /// The recipient was force-evicted from a voice channel.
    VoiceEvicted { room: String },
    /// Viewer-safe presence snapshot of a friend.
    Presence {
        username: String,
        online: bool,
        presence: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_text: Option<String>,
    },
    /// A room message fanned out to roster members.
    RoomMsg {
        room: String,
        from: String,
        text: String,
        encrypted: bool,
    },
    /// Signaling relay to the counterparty.
    Signal {
        session_id: String,
        from: String,
        event: &'static str,
        #[serde(skip_serializing_if = "serde_json::Value::is_null")]
        payload: serde_json::Value,
    },
    /// The recipient was automatically muted by the abuse engine.
    AutoMuted { minutes: i64, reason: String },
    /// Request denied. `retry_after` accompanies rate/slowmode denials.
    Deny {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<i64>,
    },
    Pong,
}

impl ServerEvent {
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn deny_retry(reason: impl Into<String>, retry_after: i64) -> Self {
        Self::Deny {
            reason: reason.into(),
            retry_after: Some(retry_after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_frames_decode_by_op_tag() {
        let frame: ClientEvent =
            serde_json::from_str(r#"{"op":"join","d":{"room":"Lobby"}}"#).unwrap();
        assert!(matches!(frame, ClientEvent::Join { room } if room == "Lobby"));

        let frame: ClientEvent =
            serde_json::from_str(r#"{"op":"msg","d":{"text":"hi"}}"#).unwrap();
        match frame {
            ClientEvent::Msg { text, encrypted } => {
                assert_eq!(text, "hi");
                assert!(!encrypted);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn roster_event_serializes_with_tag_and_data() {
        let event = ServerEvent::RoomRoster {
            room: "Lobby".into(),
            members: vec!["alice".into(), "bob".into()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["t"], "room_roster");
        assert_eq!(json["d"]["room"], "Lobby");
        assert_eq!(json["d"]["members"][1], "bob");
    }

    #[test]
    fn suppressed_status_text_is_omitted_from_the_wire() {
        let event = ServerEvent::Presence {
            username: "alice".into(),
            online: false,
            presence: "offline".into(),
            status_text: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["d"].get("status_text").is_none());
    }
}
