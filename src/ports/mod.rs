//! Port traits. API boundaries for the hexagon.
//!
//! - Outbound: Called by application into infrastructure (TeamSpeak, forum DB, files)

pub mod outbound;

pub use outbound::{AuditLog, ChatDirectory, ChatMessenger, ForumStore, GroupMapPersistence};
