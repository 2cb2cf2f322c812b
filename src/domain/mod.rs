//! # Domain Layer
//!
//! Core business types of the session/presence core, independent of any
//! framework or infrastructure concern.
//!
//! - **entities**: AuthSession and AuthToken plus their repository traits
//! - **ports**: traits for the external collaborators the core consumes
//!
//! Repository and port traits are implemented in the infrastructure layer,
//! following the dependency inversion principle.

pub mod entities;
pub mod ports;

pub use entities::*;
pub use ports::{
    knob_or, CredentialVerifier, FriendsProvider, PermissionChecker, PresenceProfile,
    PresenceStatus, ProfileStore, RoomDirectory, RoomInfo, RuntimeSettings, SanctionKind,
    Sanctions,
};
