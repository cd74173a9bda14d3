//! Domain entities. Pure data structures for the core business.
//!
//! No ServerQuery/SQL types here; adapters map into these.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// TeamSpeak server group id (`sgid`).
pub type ChatGroupId = u64;

/// Forum usergroup id.
pub type ForumGroupId = i64;

/// A forum usergroup. Snapshot per sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumGroup {
    pub id: ForumGroupId,
    pub name: String,
}

/// A forum account that belongs to one of the queried groups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumMember {
    pub account_id: i64,
    pub name: String,
    /// Linked TeamSpeak unique identifier, already trimmed.
    pub identity: String,
    /// Division / cohort label, used only for reporting.
    pub division: Option<String>,
    /// Membership request filed but not yet approved.
    pub pending: bool,
}

/// Forum account returned by a successful credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAccount {
    pub account_id: i64,
    pub username: String,
    pub valid: bool,
}

/// Forum account as seen through its linked identity, with every group it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedAccount {
    pub account_id: i64,
    pub username: String,
    pub groups: Vec<ForumGroupId>,
}

/// A TeamSpeak server group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatGroup {
    pub id: ChatGroupId,
    pub name: String,
}

/// A client currently in a server group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatGroupMember {
    pub identity: String,
    pub nickname: String,
    pub db_id: u64,
}

/// A client database entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatAccount {
    pub db_id: u64,
    pub identity: String,
    pub nickname: String,
}

/// Sender of a private text message, resolved against the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoker {
    /// Connection id; used as the reply target.
    pub client_id: u64,
    pub db_id: u64,
    pub unique_id: String,
    pub nickname: String,
    pub server_groups: Vec<ChatGroupId>,
}

impl std::fmt::Display for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.nickname, self.unique_id)
    }
}

/// Online/max client counts for the population log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Population {
    pub online: u32,
    pub max: u32,
}

/// One entry of the group map file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMapping {
    #[serde(deserialize_with = "sgid_from_number_or_string")]
    pub sgid: ChatGroupId,
    pub forum_groups: BTreeSet<ForumGroupId>,
    #[serde(default)]
    pub permanent: bool,
}

/// Full group map keyed by server group name.
pub type GroupMap = BTreeMap<String, GroupMapping>;

/// Older map files stored the sgid as a string.
fn sgid_from_number_or_string<'de, D>(deserializer: D) -> Result<ChatGroupId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(ChatGroupId),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_accepts_string_sgid() {
        let json = r#"{"AOD Officers": {"sgid": "42", "forumGroups": [7, 3], "permanent": true}}"#;
        let map: GroupMap = serde_json::from_str(json).unwrap();
        let entry = &map["AOD Officers"];
        assert_eq!(entry.sgid, 42);
        assert!(entry.permanent);
        assert_eq!(entry.forum_groups.iter().copied().collect::<Vec<_>>(), vec![3, 7]);
    }

    #[test]
    fn mapping_permanent_defaults_to_false() {
        let json = r#"{"sgid": 9, "forumGroups": [1]}"#;
        let entry: GroupMapping = serde_json::from_str(json).unwrap();
        assert!(!entry.permanent);
        assert_eq!(entry.sgid, 9);
    }

    #[test]
    fn mapping_rejects_non_numeric_sgid() {
        let json = r#"{"sgid": "serverGroup.sgid", "forumGroups": [1]}"#;
        assert!(serde_json::from_str::<GroupMapping>(json).is_err());
    }
}
