//! Group map: which forum groups feed which TeamSpeak server group.
//!
//! The map is loaded once, cached in memory and written through on every mutation.
//! The forum-group → server-group index is derived from it lazily and dropped on write.

use crate::domain::{
    ChatGroup, ChatGroupId, DomainError, ForumGroup, ForumGroupId, GroupMap, GroupMapping,
};
use crate::ports::{ChatDirectory, ForumStore, GroupMapPersistence};
use crate::shared::SharedSettings;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// forum group id → (server group id → server group).
pub type ResolvedGroupIndex = BTreeMap<ForumGroupId, BTreeMap<ChatGroupId, ChatGroup>>;

pub struct GroupMapStore {
    persistence: Arc<dyn GroupMapPersistence>,
    chat: Arc<dyn ChatDirectory>,
    forum: Arc<dyn ForumStore>,
    settings: SharedSettings,
    map: RwLock<GroupMap>,
    index: Mutex<Option<Arc<ResolvedGroupIndex>>>,
}

impl GroupMapStore {
    /// Load the persisted map.
    pub async fn load(
        persistence: Arc<dyn GroupMapPersistence>,
        chat: Arc<dyn ChatDirectory>,
        forum: Arc<dyn ForumStore>,
        settings: SharedSettings,
    ) -> Result<Self, DomainError> {
        let map = persistence.load().await?;
        info!(mappings = map.len(), "group map loaded");
        Ok(Self {
            persistence,
            chat,
            forum,
            settings,
            map: RwLock::new(map),
            index: Mutex::new(None),
        })
    }

    pub async fn list_mappings(&self) -> GroupMap {
        self.map.read().await.clone()
    }

    /// Look up an eligible server group by name.
    pub async fn resolve_chat_group(&self, name: &str) -> Result<ChatGroup, DomainError> {
        self.check_chat_eligible(name)?;
        self.chat
            .get_group_by_name(name)
            .await?
            .ok_or_else(|| DomainError::GroupNotFound(format!("{} server", name)))
    }

    /// Look up an eligible forum group by name.
    pub async fn resolve_forum_group(&self, name: &str) -> Result<ForumGroup, DomainError> {
        self.check_forum_eligible(name)?;
        self.forum
            .list_groups()
            .await?
            .into_iter()
            .find(|g| g.name == name)
            .ok_or_else(|| DomainError::GroupNotFound(name.to_string()))
    }

    fn check_chat_eligible(&self, name: &str) -> Result<(), DomainError> {
        if name.ends_with(&self.settings.current().ts_officer_suffix) {
            Ok(())
        } else {
            Err(DomainError::NotEligible(
                "Only Officer Server Groups may be mapped".into(),
            ))
        }
    }

    fn check_forum_eligible(&self, name: &str) -> Result<(), DomainError> {
        if name.ends_with(&self.settings.current().forum_officer_suffix) {
            Ok(())
        } else {
            Err(DomainError::NotEligible(
                "Only Officer Forum Groups may be mapped".into(),
            ))
        }
    }

    /// Map `forum_group` onto `chat_group`. Persists, then drops the index.
    pub async fn add_mapping(
        &self,
        chat_group: &ChatGroup,
        forum_group: &ForumGroup,
    ) -> Result<(), DomainError> {
        self.check_chat_eligible(&chat_group.name)?;
        self.check_forum_eligible(&forum_group.name)?;

        let mut map = self.map.write().await;
        let mut next = map.clone();
        match next.get_mut(&chat_group.name) {
            Some(entry) if entry.permanent => {
                return Err(DomainError::Immutable(chat_group.name.clone()));
            }
            Some(entry) => {
                if !entry.forum_groups.insert(forum_group.id) {
                    return Err(DomainError::AlreadyMapped);
                }
                entry.sgid = chat_group.id;
            }
            None => {
                next.insert(
                    chat_group.name.clone(),
                    GroupMapping {
                        sgid: chat_group.id,
                        forum_groups: [forum_group.id].into_iter().collect(),
                        permanent: false,
                    },
                );
            }
        }

        self.persistence.save(&next).await?;
        *map = next;
        drop(map);
        self.invalidate_index().await;
        info!(
            server_group = %chat_group.name,
            forum_group = %forum_group.name,
            "group mapping added"
        );
        Ok(())
    }

    /// Remove `forum_group` from `chat_group`'s mapping; the entry goes away with its last group.
    pub async fn remove_mapping(
        &self,
        chat_group: &ChatGroup,
        forum_group: &ForumGroup,
    ) -> Result<(), DomainError> {
        self.check_chat_eligible(&chat_group.name)?;
        self.check_forum_eligible(&forum_group.name)?;

        let mut map = self.map.write().await;
        let mut next = map.clone();
        let entry = next
            .get_mut(&chat_group.name)
            .ok_or(DomainError::MapNotFound)?;
        if entry.permanent {
            return Err(DomainError::Immutable(chat_group.name.clone()));
        }
        if !entry.forum_groups.remove(&forum_group.id) {
            return Err(DomainError::MapNotFound);
        }
        if entry.forum_groups.is_empty() {
            next.remove(&chat_group.name);
        }

        self.persistence.save(&next).await?;
        *map = next;
        drop(map);
        self.invalidate_index().await;
        info!(
            server_group = %chat_group.name,
            forum_group = %forum_group.name,
            "group mapping removed"
        );
        Ok(())
    }

    pub async fn invalidate_index(&self) {
        *self.index.lock().await = None;
    }

    /// Cached index, rebuilt from the map and live server group lookups when absent.
    pub async fn resolved_index(&self) -> Result<Arc<ResolvedGroupIndex>, DomainError> {
        let mut slot = self.index.lock().await;
        if let Some(index) = slot.as_ref() {
            return Ok(Arc::clone(index));
        }

        let map = self.list_mappings().await;
        let mut index = ResolvedGroupIndex::new();
        for (name, mapping) in &map {
            let Some(group) = self.chat.get_group_by_id(mapping.sgid).await? else {
                warn!(map = %name, sgid = mapping.sgid, "bad map: server group does not exist");
                continue;
            };
            for forum_group in &mapping.forum_groups {
                index
                    .entry(*forum_group)
                    .or_default()
                    .insert(group.id, group.clone());
            }
        }

        let index = Arc::new(index);
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::BotSettings;
    use crate::usecases::fakes::{FakeChat, FakeForum, MemoryMapPersistence};
    use std::sync::atomic::Ordering;

    fn chat() -> FakeChat {
        FakeChat::new()
            .with_group(20, "Alpha Officer")
            .with_group(21, "Bravo Officer")
            .with_group(22, "Member")
    }

    fn forum() -> FakeForum {
        FakeForum::new()
            .with_group(5, "Alpha Officers")
            .with_group(6, "Bravo Officers")
            .with_group(7, "Registered Users")
    }

    async fn store(map: GroupMap) -> (GroupMapStore, Arc<MemoryMapPersistence>) {
        let persistence = Arc::new(MemoryMapPersistence::with_map(map));
        let store = GroupMapStore::load(
            persistence.clone(),
            Arc::new(chat()),
            Arc::new(forum()),
            SharedSettings::new(BotSettings::default()),
        )
        .await
        .unwrap();
        (store, persistence)
    }

    fn mapping(sgid: ChatGroupId, groups: &[ForumGroupId], permanent: bool) -> GroupMapping {
        GroupMapping {
            sgid,
            forum_groups: groups.iter().copied().collect(),
            permanent,
        }
    }

    #[tokio::test]
    async fn add_persists_and_lists() {
        let (store, persistence) = store(GroupMap::new()).await;
        let cg = store.resolve_chat_group("Alpha Officer").await.unwrap();
        let fg = store.resolve_forum_group("Alpha Officers").await.unwrap();
        store.add_mapping(&cg, &fg).await.unwrap();

        let listed = store.list_mappings().await;
        assert_eq!(listed["Alpha Officer"], mapping(20, &[5], false));
        assert_eq!(persistence.stored(), listed);
    }

    #[tokio::test]
    async fn add_twice_reports_already_mapped() {
        let (store, persistence) = store(GroupMap::new()).await;
        let cg = store.resolve_chat_group("Alpha Officer").await.unwrap();
        let fg = store.resolve_forum_group("Alpha Officers").await.unwrap();
        store.add_mapping(&cg, &fg).await.unwrap();
        assert_eq!(
            store.add_mapping(&cg, &fg).await,
            Err(DomainError::AlreadyMapped)
        );
        assert_eq!(persistence.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn suffix_gates_both_sides() {
        let (store, _) = store(GroupMap::new()).await;
        assert!(matches!(
            store.resolve_chat_group("Member").await,
            Err(DomainError::NotEligible(_))
        ));
        assert!(matches!(
            store.resolve_forum_group("Registered Users").await,
            Err(DomainError::NotEligible(_))
        ));
        let member = ChatGroup {
            id: 22,
            name: "Member".into(),
        };
        let fg = store.resolve_forum_group("Alpha Officers").await.unwrap();
        assert!(matches!(
            store.add_mapping(&member, &fg).await,
            Err(DomainError::NotEligible(_))
        ));
    }

    #[tokio::test]
    async fn unknown_groups_are_not_found() {
        let (store, _) = store(GroupMap::new()).await;
        assert!(matches!(
            store.resolve_chat_group("Charlie Officer").await,
            Err(DomainError::GroupNotFound(_))
        ));
        assert!(matches!(
            store.resolve_forum_group("Charlie Officers").await,
            Err(DomainError::GroupNotFound(_))
        ));
    }

    #[tokio::test]
    async fn permanent_mapping_is_immutable() {
        let mut map = GroupMap::new();
        map.insert("Alpha Officer".into(), mapping(20, &[5], true));
        let (store, persistence) = store(map).await;
        let cg = store.resolve_chat_group("Alpha Officer").await.unwrap();
        let alpha = store.resolve_forum_group("Alpha Officers").await.unwrap();
        let bravo = store.resolve_forum_group("Bravo Officers").await.unwrap();

        assert!(matches!(
            store.add_mapping(&cg, &bravo).await,
            Err(DomainError::Immutable(_))
        ));
        assert!(matches!(
            store.remove_mapping(&cg, &alpha).await,
            Err(DomainError::Immutable(_))
        ));
        assert_eq!(persistence.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn removing_last_group_drops_entry() {
        let mut map = GroupMap::new();
        map.insert("Alpha Officer".into(), mapping(20, &[5, 6], false));
        let (store, persistence) = store(map).await;
        let cg = store.resolve_chat_group("Alpha Officer").await.unwrap();
        let alpha = store.resolve_forum_group("Alpha Officers").await.unwrap();
        let bravo = store.resolve_forum_group("Bravo Officers").await.unwrap();

        store.remove_mapping(&cg, &alpha).await.unwrap();
        assert_eq!(store.list_mappings().await["Alpha Officer"], mapping(20, &[6], false));
        store.remove_mapping(&cg, &bravo).await.unwrap();
        assert!(store.list_mappings().await.is_empty());
        assert!(persistence.stored().is_empty());
        assert_eq!(
            store.remove_mapping(&cg, &bravo).await,
            Err(DomainError::MapNotFound)
        );
    }

    #[tokio::test]
    async fn failed_persist_leaves_cache_untouched() {
        let (store, persistence) = store(GroupMap::new()).await;
        *persistence.fail_saves.lock().unwrap() = true;
        let cg = store.resolve_chat_group("Alpha Officer").await.unwrap();
        let fg = store.resolve_forum_group("Alpha Officers").await.unwrap();
        assert!(matches!(
            store.add_mapping(&cg, &fg).await,
            Err(DomainError::Persistence(_))
        ));
        assert!(store.list_mappings().await.is_empty());
    }

    #[tokio::test]
    async fn index_is_rebuilt_after_mutation() {
        let mut map = GroupMap::new();
        map.insert("Alpha Officer".into(), mapping(20, &[5], false));
        map.insert("Ghost Officer".into(), mapping(99, &[5], false));
        let (store, _) = store(map).await;

        let index = store.resolved_index().await.unwrap();
        assert_eq!(index[&5].keys().copied().collect::<Vec<_>>(), vec![20]);
        assert!(!index.contains_key(&6));

        let cg = store.resolve_chat_group("Bravo Officer").await.unwrap();
        let fg = store.resolve_forum_group("Bravo Officers").await.unwrap();
        store.add_mapping(&cg, &fg).await.unwrap();

        let index = store.resolved_index().await.unwrap();
        assert_eq!(index[&6][&21].name, "Bravo Officer");
    }
}
