//! Outbound ports. Application calls into infrastructure.
//!
//! Implemented by adapters.

use crate::domain::{
    ChatAccount, ChatGroup, ChatGroupId, ChatGroupMember, DomainError, ForumGroup, ForumGroupId,
    ForumMember, GroupMap, LinkedAccount, Population, VerifiedAccount,
};

/// TeamSpeak directory: server groups and the client database.
///
/// Every method fails with `DomainError::ChatUnavailable` when the server cannot be reached.
#[async_trait::async_trait]
pub trait ChatDirectory: Send + Sync {
    /// Clients currently in the server group. An empty group yields an empty list.
    async fn list_group_members(
        &self,
        group_id: ChatGroupId,
    ) -> Result<Vec<ChatGroupMember>, DomainError>;

    /// Client database lookup by unique identifier. Case-insensitive on the server side,
    /// so callers must re-check the identity via `get_account_detail`.
    async fn find_account_by_identity(
        &self,
        identity: &str,
    ) -> Result<Option<ChatAccount>, DomainError>;

    /// Authoritative client database entry.
    async fn get_account_detail(&self, db_id: u64) -> Result<Option<ChatAccount>, DomainError>;

    async fn add_account_to_group(&self, db_id: u64, group_id: ChatGroupId)
    -> Result<(), DomainError>;

    async fn remove_account_from_group(
        &self,
        db_id: u64,
        group_id: ChatGroupId,
    ) -> Result<(), DomainError>;

    async fn list_groups(&self) -> Result<Vec<ChatGroup>, DomainError>;

    async fn get_group_by_name(&self, name: &str) -> Result<Option<ChatGroup>, DomainError>;

    async fn get_group_by_id(&self, id: ChatGroupId) -> Result<Option<ChatGroup>, DomainError>;

    /// Server groups the client database entry belongs to.
    async fn groups_for_account(&self, db_id: u64) -> Result<Vec<ChatGroupId>, DomainError>;

    /// Online and maximum client counts of the virtual server.
    async fn population(&self) -> Result<Population, DomainError>;
}

/// Private text replies to a connected client.
#[async_trait::async_trait]
pub trait ChatMessenger: Send + Sync {
    async fn send_private(&self, client_id: u64, text: &str) -> Result<(), DomainError>;
}

/// Forum membership store. Queries are parameterized; caller strings are never interpolated.
#[async_trait::async_trait]
pub trait ForumStore: Send + Sync {
    async fn list_groups(&self) -> Result<Vec<ForumGroup>, DomainError>;

    /// Accounts with a linked identity in any of `group_ids` (primary or secondary group).
    /// With `include_pending`, accounts with an open membership request are included too.
    async fn list_members_for_groups(
        &self,
        group_ids: &[ForumGroupId],
        include_pending: bool,
    ) -> Result<Vec<ForumMember>, DomainError>;

    /// Check `secret_hash` (hex MD5 of the secret) for the username or email.
    /// `None` when no such account exists.
    async fn verify_credential(
        &self,
        username: &str,
        secret_hash: &str,
    ) -> Result<Option<VerifiedAccount>, DomainError>;

    async fn set_linked_identity(&self, account_id: i64, identity: &str)
    -> Result<(), DomainError>;

    async fn clear_linked_identity(&self, account_id: i64) -> Result<(), DomainError>;

    /// Accounts other than `excluding_account_id` already linked to `identity`.
    async fn find_conflicting_links(
        &self,
        identity: &str,
        excluding_account_id: i64,
    ) -> Result<Vec<LinkedAccount>, DomainError>;

    /// Every account linked to `identity`, with its groups.
    async fn find_accounts_by_identity(
        &self,
        identity: &str,
    ) -> Result<Vec<LinkedAccount>, DomainError>;
}

/// Durable storage for the group map.
#[async_trait::async_trait]
pub trait GroupMapPersistence: Send + Sync {
    async fn load(&self) -> Result<GroupMap, DomainError>;

    /// Replace the stored map. Must be atomic with respect to crashes.
    async fn save(&self, map: &GroupMap) -> Result<(), DomainError>;
}

/// Append-only text audit logs.
#[async_trait::async_trait]
pub trait AuditLog: Send + Sync {
    /// Sync activity log.
    async fn append_sync(&self, text: &str) -> Result<(), DomainError>;

    /// Population snapshot log.
    async fn append_population(&self, text: &str) -> Result<(), DomainError>;
}
