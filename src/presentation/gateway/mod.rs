//! Gateway Module
//!
//! The persistent-connection side of the core: connection registry, room
//! and voice rosters, presence fan-out, ephemeral signaling, and the
//! WebSocket handler tying them together.

pub mod events;
pub mod handler;
pub mod lifecycle;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod signaling;

pub use events::{ClientEvent, ServerEvent};
pub use handler::ws_handler;
pub use lifecycle::ConnectionLifecycle;
pub use presence::PresenceBroadcaster;
pub use registry::ConnectionRegistry;
pub use rooms::{RoomService, VoiceRosterManager};
pub use signaling::{SignalKind, SignalingTable};
