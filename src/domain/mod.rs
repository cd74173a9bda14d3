//! Core domain layer. No external I/O dependencies.
//!
//! Entities and business rules live here. Dependencies flow inward.

pub mod entities;
pub mod errors;
pub mod permission;

pub use entities::{
    ChatAccount, ChatGroup, ChatGroupId, ChatGroupMember, ForumGroup, ForumGroupId, ForumMember,
    GroupMap, GroupMapping, Invoker, LinkedAccount, Population, VerifiedAccount,
};
pub use errors::DomainError;
pub use permission::{PermissionTier, TierGroups};
