//! In-memory port implementations for use case tests. They record mutating calls.

use crate::domain::{
    ChatAccount, ChatGroup, ChatGroupId, ChatGroupMember, DomainError, ForumGroup, ForumGroupId,
    ForumMember, GroupMap, LinkedAccount, Population, VerifiedAccount,
};
use crate::ports::{AuditLog, ChatDirectory, ChatMessenger, ForumStore, GroupMapPersistence};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct FakeChatState {
    pub groups: Vec<ChatGroup>,
    pub accounts: Vec<ChatAccount>,
    pub membership: HashMap<ChatGroupId, Vec<u64>>,
    pub failing_groups: HashSet<ChatGroupId>,
    pub failing_adds: HashSet<u64>,
    pub sent: Vec<(u64, String)>,
}

/// TeamSpeak double. Identity lookups are case-insensitive like the real `clientdbfind`.
#[derive(Default)]
pub struct FakeChat {
    pub state: Mutex<FakeChatState>,
    pub add_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
}

impl FakeChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, id: ChatGroupId, name: &str) -> Self {
        self.state.lock().unwrap().groups.push(ChatGroup {
            id,
            name: name.to_string(),
        });
        self
    }

    pub fn with_account(self, db_id: u64, identity: &str, nickname: &str) -> Self {
        self.state.lock().unwrap().accounts.push(ChatAccount {
            db_id,
            identity: identity.to_string(),
            nickname: nickname.to_string(),
        });
        self
    }

    pub fn with_member(self, group: ChatGroupId, db_id: u64) -> Self {
        self.state
            .lock()
            .unwrap()
            .membership
            .entry(group)
            .or_default()
            .push(db_id);
        self
    }

    pub fn members_of(&self, group: ChatGroupId) -> Vec<u64> {
        let mut ids = self
            .state
            .lock()
            .unwrap()
            .membership
            .get(&group)
            .cloned()
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn fail_group(&self, group: ChatGroupId) {
        self.state.lock().unwrap().failing_groups.insert(group);
    }

    pub fn fail_add_for(&self, db_id: u64) {
        self.state.lock().unwrap().failing_adds.insert(db_id);
    }

    pub fn sent(&self) -> Vec<(u64, String)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn mutations(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst) + self.remove_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChatDirectory for FakeChat {
    async fn list_group_members(
        &self,
        group_id: ChatGroupId,
    ) -> Result<Vec<ChatGroupMember>, DomainError> {
        let state = self.state.lock().unwrap();
        if state.failing_groups.contains(&group_id) {
            return Err(DomainError::ChatUnavailable("group listing failed".into()));
        }
        let ids = state.membership.get(&group_id).cloned().unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.accounts.iter().find(|a| a.db_id == id))
            .map(|a| ChatGroupMember {
                identity: a.identity.clone(),
                nickname: a.nickname.clone(),
                db_id: a.db_id,
            })
            .collect())
    }

    async fn find_account_by_identity(
        &self,
        identity: &str,
    ) -> Result<Option<ChatAccount>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .accounts
            .iter()
            .find(|a| a.identity.eq_ignore_ascii_case(identity))
            .cloned())
    }

    async fn get_account_detail(&self, db_id: u64) -> Result<Option<ChatAccount>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state.accounts.iter().find(|a| a.db_id == db_id).cloned())
    }

    async fn add_account_to_group(
        &self,
        db_id: u64,
        group_id: ChatGroupId,
    ) -> Result<(), DomainError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.failing_adds.contains(&db_id) {
            return Err(DomainError::ChatUnavailable("add rejected".into()));
        }
        let members = state.membership.entry(group_id).or_default();
        if !members.contains(&db_id) {
            members.push(db_id);
        }
        Ok(())
    }

    async fn remove_account_from_group(
        &self,
        db_id: u64,
        group_id: ChatGroupId,
    ) -> Result<(), DomainError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(members) = state.membership.get_mut(&group_id) {
            members.retain(|id| *id != db_id);
        }
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<ChatGroup>, DomainError> {
        Ok(self.state.lock().unwrap().groups.clone())
    }

    async fn get_group_by_name(&self, name: &str) -> Result<Option<ChatGroup>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state.groups.iter().find(|g| g.name == name).cloned())
    }

    async fn get_group_by_id(&self, id: ChatGroupId) -> Result<Option<ChatGroup>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state.groups.iter().find(|g| g.id == id).cloned())
    }

    async fn groups_for_account(&self, db_id: u64) -> Result<Vec<ChatGroupId>, DomainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .membership
            .iter()
            .filter(|(_, ids)| ids.contains(&db_id))
            .map(|(g, _)| *g)
            .collect())
    }

    async fn population(&self) -> Result<Population, DomainError> {
        Ok(Population {
            online: 12,
            max: 64,
        })
    }
}

#[async_trait::async_trait]
impl ChatMessenger for FakeChat {
    async fn send_private(&self, client_id: u64, text: &str) -> Result<(), DomainError> {
        self.state
            .lock()
            .unwrap()
            .sent
            .push((client_id, text.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FakeForumAccount {
    pub id: i64,
    pub username: String,
    pub secret_hash: String,
    pub identity: String,
    pub division: Option<String>,
    pub pending: bool,
    pub groups: Vec<ForumGroupId>,
}

impl FakeForumAccount {
    pub fn new(id: i64, username: &str, identity: &str, groups: &[ForumGroupId]) -> Self {
        Self {
            id,
            username: username.to_string(),
            secret_hash: String::new(),
            identity: identity.to_string(),
            division: Some("Test Division".to_string()),
            pending: false,
            groups: groups.to_vec(),
        }
    }

    pub fn pending(mut self) -> Self {
        self.pending = true;
        self
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        use md5::{Digest, Md5};
        self.secret_hash = format!("{:x}", Md5::digest(secret.as_bytes()));
        self
    }
}

#[derive(Default)]
pub struct FakeForumState {
    pub groups: Vec<ForumGroup>,
    pub accounts: Vec<FakeForumAccount>,
    pub failing_groups: HashSet<ForumGroupId>,
    pub unavailable: bool,
}

#[derive(Default)]
pub struct FakeForum {
    pub state: Mutex<FakeForumState>,
    pub verify_calls: AtomicUsize,
    /// Artificial latency of `verify_credential`.
    pub verify_delay_ms: AtomicU64,
}

impl FakeForum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, id: ForumGroupId, name: &str) -> Self {
        self.state.lock().unwrap().groups.push(ForumGroup {
            id,
            name: name.to_string(),
        });
        self
    }

    pub fn with_account(self, account: FakeForumAccount) -> Self {
        self.state.lock().unwrap().accounts.push(account);
        self
    }

    pub fn account(&self, id: i64) -> Option<FakeForumAccount> {
        let state = self.state.lock().unwrap();
        state.accounts.iter().find(|a| a.id == id).cloned()
    }

    pub fn fail_group(&self, id: ForumGroupId) {
        self.state.lock().unwrap().failing_groups.insert(id);
    }

    pub fn with_verify_delay(self, delay: Duration) -> Self {
        self.verify_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    fn check_available(state: &FakeForumState) -> Result<(), DomainError> {
        if state.unavailable {
            return Err(DomainError::StoreUnavailable("connection lost".into()));
        }
        Ok(())
    }

    fn linked(account: &FakeForumAccount) -> LinkedAccount {
        LinkedAccount {
            account_id: account.id,
            username: account.username.clone(),
            groups: account.groups.clone(),
        }
    }
}

#[async_trait::async_trait]
impl ForumStore for FakeForum {
    async fn list_groups(&self) -> Result<Vec<ForumGroup>, DomainError> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state.groups.clone())
    }

    async fn list_members_for_groups(
        &self,
        group_ids: &[ForumGroupId],
        include_pending: bool,
    ) -> Result<Vec<ForumMember>, DomainError> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        if group_ids.iter().any(|g| state.failing_groups.contains(g)) {
            return Err(DomainError::StoreUnavailable("query failed".into()));
        }
        Ok(state
            .accounts
            .iter()
            .filter(|a| !a.identity.trim().is_empty())
            .filter(|a| a.groups.iter().any(|g| group_ids.contains(g)))
            .filter(|a| include_pending || !a.pending)
            .map(|a| ForumMember {
                account_id: a.id,
                name: a.username.clone(),
                identity: a.identity.trim().to_string(),
                division: a.division.clone(),
                pending: a.pending,
            })
            .collect())
    }

    async fn verify_credential(
        &self,
        username: &str,
        secret_hash: &str,
    ) -> Result<Option<VerifiedAccount>, DomainError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.verify_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state
            .accounts
            .iter()
            .find(|a| a.username == username)
            .map(|a| VerifiedAccount {
                account_id: a.id,
                username: a.username.clone(),
                valid: a.secret_hash == secret_hash,
            }))
    }

    async fn set_linked_identity(
        &self,
        account_id: i64,
        identity: &str,
    ) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        if let Some(a) = state.accounts.iter_mut().find(|a| a.id == account_id) {
            a.identity = identity.to_string();
        }
        Ok(())
    }

    async fn clear_linked_identity(&self, account_id: i64) -> Result<(), DomainError> {
        self.set_linked_identity(account_id, "").await
    }

    async fn find_conflicting_links(
        &self,
        identity: &str,
        excluding_account_id: i64,
    ) -> Result<Vec<LinkedAccount>, DomainError> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state
            .accounts
            .iter()
            .filter(|a| a.identity == identity && a.id != excluding_account_id)
            .map(Self::linked)
            .collect())
    }

    async fn find_accounts_by_identity(
        &self,
        identity: &str,
    ) -> Result<Vec<LinkedAccount>, DomainError> {
        let state = self.state.lock().unwrap();
        Self::check_available(&state)?;
        Ok(state
            .accounts
            .iter()
            .filter(|a| a.identity == identity)
            .map(Self::linked)
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryMapPersistence {
    pub map: Mutex<GroupMap>,
    pub saves: AtomicUsize,
    pub fail_saves: Mutex<bool>,
}

impl MemoryMapPersistence {
    pub fn with_map(map: GroupMap) -> Self {
        Self {
            map: Mutex::new(map),
            ..Default::default()
        }
    }

    pub fn stored(&self) -> GroupMap {
        self.map.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl GroupMapPersistence for MemoryMapPersistence {
    async fn load(&self) -> Result<GroupMap, DomainError> {
        Ok(self.map.lock().unwrap().clone())
    }

    async fn save(&self, map: &GroupMap) -> Result<(), DomainError> {
        if *self.fail_saves.lock().unwrap() {
            return Err(DomainError::Persistence("disk full".into()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        *self.map.lock().unwrap() = map.clone();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditLog {
    pub sync: Mutex<String>,
    pub population: Mutex<String>,
}

impl MemoryAuditLog {
    pub fn sync_text(&self) -> String {
        self.sync.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append_sync(&self, text: &str) -> Result<(), DomainError> {
        self.sync.lock().unwrap().push_str(text);
        Ok(())
    }

    async fn append_population(&self, text: &str) -> Result<(), DomainError> {
        self.population.lock().unwrap().push_str(text);
        Ok(())
    }
}
