//! Map ServerQuery records to domain entities.
//!
//! Records missing a required field map to `None` and are skipped by the caller.

use super::codec::Record;
use crate::domain::{ChatAccount, ChatGroup, ChatGroupId, ChatGroupMember, Invoker, Population};

/// `servergroupclientlist -names` entry.
///
/// An empty group may answer with a record that carries no `cldbid`.
pub fn group_member(record: &Record) -> Option<ChatGroupMember> {
    Some(ChatGroupMember {
        db_id: record.parse_field("cldbid")?,
        identity: record.get("client_unique_identifier")?.to_string(),
        nickname: record.get("client_nickname").unwrap_or_default().to_string(),
    })
}

/// `clientdbinfo` reply. The request's cldbid is not echoed back.
pub fn db_account(db_id: u64, record: &Record) -> Option<ChatAccount> {
    Some(ChatAccount {
        db_id,
        identity: record.get("client_unique_identifier")?.to_string(),
        nickname: record.get("client_nickname").unwrap_or_default().to_string(),
    })
}

/// `servergrouplist` entry.
pub fn server_group(record: &Record) -> Option<ChatGroup> {
    Some(ChatGroup {
        id: record.parse_field("sgid")?,
        name: record.get("name")?.to_string(),
    })
}

/// Comma separated `client_servergroups`.
pub fn group_ids(list: &str) -> Vec<ChatGroupId> {
    list.split(',')
        .filter_map(|id| id.trim().parse().ok())
        .collect()
}

/// `clientinfo` reply for the sender of a message.
pub fn invoker(client_id: u64, record: &Record) -> Option<Invoker> {
    Some(Invoker {
        client_id,
        db_id: record.parse_field("client_database_id")?,
        unique_id: record.get("client_unique_identifier")?.to_string(),
        nickname: record.get("client_nickname").unwrap_or_default().to_string(),
        server_groups: group_ids(record.get("client_servergroups").unwrap_or_default()),
    })
}

/// `serverinfo`. Query clients are not counted as online.
pub fn population(record: &Record) -> Option<Population> {
    let online: u32 = record.parse_field("virtualserver_clientsonline")?;
    let query: u32 = record
        .parse_field("virtualserver_queryclientsonline")
        .unwrap_or(0);
    Some(Population {
        online: online.saturating_sub(query),
        max: record.parse_field("virtualserver_maxclients")?,
    })
}
