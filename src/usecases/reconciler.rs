//! Forum → TeamSpeak group reconciliation.
//!
//! For every mapping: fetch forum members and server group members, remove clients
//! without a forum counterpart, add forum members that have a matching client, and
//! report everything else (missing clients, duplicate identities, identity mismatches).
//!
//! - One failing mapping never aborts the cycle
//! - `CheckOnly` issues no add/remove calls; the report has the same shape
//! - Only one full cycle runs at a time (`SyncAlreadyRunning`)

use crate::domain::{
    ChatAccount, ChatGroup, ChatGroupId, ChatGroupMember, DomainError, ForumMember, GroupMapping,
};
use crate::ports::{AuditLog, ChatDirectory, ForumStore};
use crate::usecases::group_map::GroupMapStore;
use crate::shared::SharedSettings;
use chrono::{SecondsFormat, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Max characters of a member list in one chat message.
const CHAT_LIST_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Apply,
    CheckOnly,
}

/// Outcome for one mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupSyncDetail {
    pub group_name: String,
    pub sgid: ChatGroupId,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub missing_account: Vec<String>,
    pub duplicates: Vec<String>,
    pub mismatches: Vec<String>,
    pub pending: Vec<String>,
    /// Individual add/remove/lookup calls that failed.
    pub failures: Vec<String>,
}

/// A mapping whose member lists could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMapping {
    pub group_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub added_count: usize,
    pub removed_count: usize,
    pub missing_account_count: usize,
    pub duplicate_count: usize,
    pub mismatch_count: usize,
    pub groups: Vec<GroupSyncDetail>,
    pub failed_mappings: Vec<FailedMapping>,
    pub elapsed: Duration,
    /// Stopped early by shutdown; `groups` holds what was processed.
    pub cancelled: bool,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            added_count: 0,
            removed_count: 0,
            missing_account_count: 0,
            duplicate_count: 0,
            mismatch_count: 0,
            groups: Vec::new(),
            failed_mappings: Vec::new(),
            elapsed: Duration::ZERO,
            cancelled: false,
        }
    }

    fn push(&mut self, detail: GroupSyncDetail) {
        self.added_count += detail.added.len();
        self.removed_count += detail.removed.len();
        self.missing_account_count += detail.missing_account.len();
        self.duplicate_count += detail.duplicates.len();
        self.mismatch_count += detail.mismatches.len();
        self.groups.push(detail);
    }

    pub fn has_changes(&self) -> bool {
        self.added_count > 0 || self.removed_count > 0
    }

    pub fn summary(&self) -> String {
        let mut msg = format!(
            "Forum Sync Processing Time: {:.3}s; {} groups added, {} groups removed, \
             {} members with no TeamSpeak client, {} duplicate tags",
            self.elapsed.as_secs_f64(),
            self.added_count,
            self.removed_count,
            self.missing_account_count,
            self.duplicate_count
        );
        if self.mismatch_count > 0 {
            msg.push_str(&format!(", {} identity mismatches", self.mismatch_count));
        }
        if !self.failed_mappings.is_empty() {
            msg.push_str(&format!(", {} maps failed", self.failed_mappings.len()));
        }
        if self.mode == SyncMode::CheckOnly {
            msg.push_str(" (check only)");
        }
        if self.cancelled {
            msg.push_str(" (cancelled)");
        }
        msg
    }

    /// Messages for an interactive caller: per-group lists, failures, then the summary.
    pub fn chat_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for g in &self.groups {
            for (title, items) in g.sections() {
                if !items.is_empty() {
                    lines.push(format!(
                        "Sync {}: {} ({}): {}",
                        g.group_name,
                        title,
                        items.len(),
                        truncate(&items.join(", "), CHAT_LIST_LIMIT)
                    ));
                }
            }
        }
        for f in &self.failed_mappings {
            lines.push(format!("Sync {} failed: {}", f.group_name, f.reason));
        }
        lines.push(self.summary());
        lines
    }
}

impl GroupSyncDetail {
    fn new(group_name: &str, sgid: ChatGroupId) -> Self {
        Self {
            group_name: group_name.to_string(),
            sgid,
            ..Default::default()
        }
    }

    fn sections(&self) -> [(&'static str, &Vec<String>); 7] {
        [
            ("Members to add", &self.added),
            ("Members to add with no TeamSpeak client", &self.missing_account),
            ("Members to remove", &self.removed),
            ("Duplicate Tags", &self.duplicates),
            ("Identity mismatches", &self.mismatches),
            ("Pending members skipped", &self.pending),
            ("Failed operations", &self.failures),
        ]
    }

    fn audit_text(&self, timestamp: &str) -> String {
        let mut text = format!("{}  Sync {}\n", timestamp, self.group_name);
        for (title, items) in self.sections() {
            if !items.is_empty() {
                text.push_str(&format!(
                    "\t{} ({}):\n\t\t{}\n",
                    title,
                    items.len(),
                    items.join("\n\t\t")
                ));
            }
        }
        text
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max.saturating_sub(5)).collect();
    format!("{} ...", head)
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Result of resolving a forum identity to a client database entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountResolution {
    Found(ChatAccount),
    /// The case-insensitive lookup hit an entry whose identity differs.
    Mismatch(ChatAccount),
    Missing,
}

/// Releases the in-flight flag when the cycle ends or its future is dropped.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reconciler {
    chat: Arc<dyn ChatDirectory>,
    forum: Arc<dyn ForumStore>,
    group_map: Arc<GroupMapStore>,
    audit: Arc<dyn AuditLog>,
    settings: SharedSettings,
    shutdown: watch::Receiver<bool>,
    in_flight: AtomicBool,
}

impl Reconciler {
    pub fn new(
        chat: Arc<dyn ChatDirectory>,
        forum: Arc<dyn ForumStore>,
        group_map: Arc<GroupMapStore>,
        audit: Arc<dyn AuditLog>,
        settings: SharedSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chat,
            forum,
            group_map,
            audit,
            settings,
            shutdown,
            in_flight: AtomicBool::new(false),
        }
    }

    fn begin(&self) -> Result<InFlightGuard<'_>, DomainError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DomainError::SyncAlreadyRunning)?;
        Ok(InFlightGuard(&self.in_flight))
    }

    async fn audit_sync(&self, text: &str) {
        if let Err(e) = self.audit.append_sync(text).await {
            warn!(error = %e, "failed to append sync log");
        }
    }

    /// Full cycle over every mapping.
    pub async fn run_sync(&self, mode: SyncMode) -> Result<SyncReport, DomainError> {
        let _guard = self.begin()?;
        let started = Instant::now();
        let settings = self.settings.current();

        self.audit_sync(&format!("{}  Forum sync started\n", timestamp()))
            .await;
        match self.chat.population().await {
            Ok(p) => {
                let line = format!("{}  {}/{}\n", timestamp(), p.online, p.max);
                if let Err(e) = self.audit.append_population(&line).await {
                    warn!(error = %e, "failed to append population log");
                }
            }
            Err(e) => warn!(error = %e, "population snapshot unavailable"),
        }

        let mappings = self.group_map.list_mappings().await;
        let mut report = SyncReport::new(mode);
        // identity → first forum member seen in a member-group mapping this cycle
        let mut seen: HashMap<String, ForumMember> = HashMap::new();

        for (name, mapping) in &mappings {
            if *self.shutdown.borrow() {
                warn!("shutdown requested; stopping group sync early");
                report.cancelled = true;
                break;
            }
            let primary = settings.is_member_group(mapping.sgid);
            match self
                .sync_group(name, mapping, mode, primary, &mut seen)
                .await
            {
                Ok(detail) => {
                    self.audit_sync(&detail.audit_text(&timestamp())).await;
                    report.push(detail);
                }
                Err(e) => {
                    error!(map = %name, sgid = mapping.sgid, error = %e, "group sync failed");
                    self.audit_sync(&format!("{}  Sync {} failed: {}\n", timestamp(), name, e))
                        .await;
                    report.failed_mappings.push(FailedMapping {
                        group_name: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.elapsed = started.elapsed();
        let summary = report.summary();
        if report.has_changes() || !report.failed_mappings.is_empty() {
            info!("{}", summary);
        } else {
            debug!("{}", summary);
        }
        self.audit_sync(&format!("{}  {}\n", timestamp(), summary))
            .await;
        Ok(report)
    }

    /// Diff and (in `Apply` mode) fix one mapping.
    async fn sync_group(
        &self,
        name: &str,
        mapping: &GroupMapping,
        mode: SyncMode,
        primary: bool,
        seen: &mut HashMap<String, ForumMember>,
    ) -> Result<GroupSyncDetail, DomainError> {
        let forum_groups: Vec<_> = mapping.forum_groups.iter().copied().collect();
        let forum_members = self
            .forum
            .list_members_for_groups(&forum_groups, primary)
            .await?;
        let chat_members = self.chat.list_group_members(mapping.sgid).await?;

        let mut detail = GroupSyncDetail::new(name, mapping.sgid);
        let chat_by_identity: HashMap<&str, &ChatGroupMember> = chat_members
            .iter()
            .map(|m| (m.identity.as_str(), m))
            .collect();

        // First forum member per identity, in store order. Non-pending accounts take
        // precedence so a pending duplicate never hides an active member.
        let mut candidates: Vec<&ForumMember> = forum_members.iter().collect();
        candidates.sort_by_key(|m| m.pending);
        let mut forum_by_identity: HashMap<&str, &ForumMember> = HashMap::new();
        let mut ordered: Vec<&ForumMember> = Vec::new();
        let mut duplicate_ids: HashSet<&str> = HashSet::new();
        for member in candidates {
            if let Some(first) = forum_by_identity.get(member.identity.as_str()) {
                if primary {
                    detail
                        .duplicates
                        .push(duplicate_label(member, &first.name));
                } else {
                    warn!(
                        identity = %member.identity,
                        user = %member.name,
                        first_seen = %first.name,
                        "duplicate identity in forum"
                    );
                }
                continue;
            }
            forum_by_identity.insert(member.identity.as_str(), member);
            ordered.push(member);

            if primary {
                match seen.get(&member.identity) {
                    // An earlier mapping only saw a pending account; this one supersedes it.
                    Some(first) if first.pending && !member.pending => {
                        detail.duplicates.push(duplicate_label(first, &member.name));
                        seen.insert(member.identity.clone(), member.clone());
                    }
                    Some(first) => {
                        detail.duplicates.push(duplicate_label(member, &first.name));
                        duplicate_ids.insert(member.identity.as_str());
                    }
                    None => {
                        seen.insert(member.identity.clone(), member.clone());
                    }
                }
            }
        }

        // Removal pass: clients without a non-pending forum member.
        for member in &chat_members {
            let keep = forum_by_identity
                .get(member.identity.as_str())
                .is_some_and(|m| !m.pending);
            if keep {
                continue;
            }
            let label = format!("{} ({})", member.identity, member.nickname);
            match mode {
                SyncMode::CheckOnly => detail.removed.push(label),
                SyncMode::Apply => match self
                    .chat
                    .remove_account_from_group(member.db_id, mapping.sgid)
                    .await
                {
                    Ok(()) => detail.removed.push(label),
                    Err(e) => {
                        error!(map = %name, identity = %member.identity, error = %e, "failed to remove client from server group");
                        detail.failures.push(format!("remove {}: {}", label, e));
                    }
                },
            }
        }

        // Addition pass: forum members without a client in the group.
        for member in ordered {
            if chat_by_identity.contains_key(member.identity.as_str()) {
                continue;
            }
            let label = format!("{} ({})", member.identity, member.name);
            if member.pending {
                detail.pending.push(label);
                continue;
            }
            if duplicate_ids.contains(member.identity.as_str()) {
                continue;
            }
            match self.resolve_account(&member.identity).await {
                Ok(AccountResolution::Found(account)) => match mode {
                    SyncMode::CheckOnly => detail.added.push(label),
                    SyncMode::Apply => match self
                        .chat
                        .add_account_to_group(account.db_id, mapping.sgid)
                        .await
                    {
                        Ok(()) => detail.added.push(label),
                        Err(e) => {
                            error!(map = %name, identity = %member.identity, error = %e, "failed to add client to server group");
                            detail.failures.push(format!("add {}: {}", label, e));
                        }
                    },
                },
                Ok(AccountResolution::Mismatch(account)) => {
                    warn!(
                        user = %member.name,
                        forum_identity = %member.identity,
                        client_identity = %account.identity,
                        db_id = account.db_id,
                        "found client db entry but identity does not match"
                    );
                    detail.mismatches.push(format!(
                        "{} -- client identity {}",
                        label, account.identity
                    ));
                }
                Ok(AccountResolution::Missing) => {
                    detail.missing_account.push(format!(
                        "{} ({} -- {})",
                        member.identity,
                        member.name,
                        member.division.as_deref().unwrap_or("")
                    ));
                }
                Err(e) => {
                    error!(identity = %member.identity, error = %e, "client lookup failed");
                    detail.failures.push(format!("lookup {}: {}", label, e));
                }
            }
        }

        Ok(detail)
    }

    /// Case-insensitive lookup followed by an exact identity check.
    pub async fn resolve_account(&self, identity: &str) -> Result<AccountResolution, DomainError> {
        let Some(candidate) = self.chat.find_account_by_identity(identity).await? else {
            return Ok(AccountResolution::Missing);
        };
        match self.chat.get_account_detail(candidate.db_id).await? {
            Some(detail) if detail.identity == identity => Ok(AccountResolution::Found(detail)),
            Some(detail) => Ok(AccountResolution::Mismatch(detail)),
            None => Ok(AccountResolution::Mismatch(candidate)),
        }
    }

    /// Grant every mapped server group for the forum account linked to `identity`.
    pub async fn apply_mappings_for(&self, identity: &str) -> Result<Vec<ChatGroup>, DomainError> {
        let mut accounts = self.forum.find_accounts_by_identity(identity).await?;
        let account = match accounts.len() {
            0 => return Ok(Vec::new()),
            1 => accounts.remove(0),
            count => {
                return Err(DomainError::AmbiguousAccount {
                    identity: identity.to_string(),
                    count,
                });
            }
        };

        let index = self.group_map.resolved_index().await?;
        let mut wanted: BTreeMap<ChatGroupId, ChatGroup> = BTreeMap::new();
        for group in &account.groups {
            if let Some(targets) = index.get(group) {
                wanted.extend(targets.iter().map(|(id, g)| (*id, g.clone())));
            }
        }
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let client = match self.resolve_account(identity).await? {
            AccountResolution::Found(client) => client,
            AccountResolution::Mismatch(client) => {
                warn!(identity, client_identity = %client.identity, "client identity mismatch; no groups granted");
                return Ok(Vec::new());
            }
            AccountResolution::Missing => return Ok(Vec::new()),
        };

        let current = self.chat.groups_for_account(client.db_id).await?;
        let mut granted = Vec::new();
        for (sgid, group) in wanted {
            if current.contains(&sgid) {
                continue;
            }
            match self.chat.add_account_to_group(client.db_id, sgid).await {
                Ok(()) => granted.push(group),
                Err(e) => {
                    warn!(identity, sgid, error = %e, "failed to grant server group");
                }
            }
        }
        if !granted.is_empty() {
            info!(
                identity,
                user = %account.username,
                groups = granted.len(),
                "granted mapped server groups"
            );
        }
        Ok(granted)
    }
}

fn duplicate_label(member: &ForumMember, first_seen: &str) -> String {
    format!(
        "{} ({}) -- First seen user {}",
        member.identity, member.name, first_seen
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ForumGroupId, GroupMap};
    use crate::shared::BotSettings;
    use crate::usecases::fakes::{
        FakeChat, FakeForum, FakeForumAccount, MemoryAuditLog, MemoryMapPersistence,
    };
    use std::sync::atomic::Ordering;

    const OFFICERS: ChatGroupId = 20;
    const MEMBERS: ChatGroupId = 30;

    struct Harness {
        chat: Arc<FakeChat>,
        forum: Arc<FakeForum>,
        audit: Arc<MemoryAuditLog>,
        reconciler: Reconciler,
        shutdown: watch::Sender<bool>,
    }

    fn mapping(sgid: ChatGroupId, groups: &[ForumGroupId]) -> GroupMapping {
        GroupMapping {
            sgid,
            forum_groups: groups.iter().copied().collect(),
            permanent: false,
        }
    }

    async fn harness(chat: FakeChat, forum: FakeForum, map: GroupMap) -> Harness {
        let chat = Arc::new(
            chat.with_group(OFFICERS, "Alpha Officer")
                .with_group(MEMBERS, "Member"),
        );
        let forum = Arc::new(forum);
        let audit = Arc::new(MemoryAuditLog::default());
        let mut settings = BotSettings::default();
        settings.tiers.member = vec![MEMBERS];
        let settings = SharedSettings::new(settings);
        let group_map = Arc::new(
            GroupMapStore::load(
                Arc::new(MemoryMapPersistence::with_map(map)),
                chat.clone(),
                forum.clone(),
                settings.clone(),
            )
            .await
            .unwrap(),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let reconciler = Reconciler::new(
            chat.clone(),
            forum.clone(),
            group_map,
            audit.clone(),
            settings,
            shutdown_rx,
        );
        Harness {
            chat,
            forum,
            audit,
            reconciler,
            shutdown,
        }
    }

    fn officers_map() -> GroupMap {
        let mut map = GroupMap::new();
        map.insert("Alpha Officer".into(), mapping(OFFICERS, &[5]));
        map
    }

    #[tokio::test]
    async fn diff_adds_and_removes_by_identity() {
        let chat = FakeChat::new()
            .with_account(1, "keep=", "Keep")
            .with_account(2, "stale=", "Stale")
            .with_account(3, "new=", "New")
            .with_member(OFFICERS, 1)
            .with_member(OFFICERS, 2);
        let forum = FakeForum::new()
            .with_account(FakeForumAccount::new(100, "keep", "keep=", &[5]))
            .with_account(FakeForumAccount::new(101, "new", "new=", &[5]))
            .with_account(FakeForumAccount::new(102, "ghost", "ghost=", &[5]));
        let h = harness(chat, forum, officers_map()).await;

        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(report.added_count, 1);
        assert_eq!(report.removed_count, 1);
        assert_eq!(report.missing_account_count, 1);
        let g = &report.groups[0];
        assert_eq!(g.added, vec!["new= (new)".to_string()]);
        assert_eq!(g.removed, vec!["stale= (Stale)".to_string()]);
        assert!(g.missing_account[0].starts_with("ghost= (ghost"));
        assert_eq!(h.chat.members_of(OFFICERS), vec![1, 3]);
    }

    #[tokio::test]
    async fn second_apply_is_a_no_op() {
        let chat = FakeChat::new()
            .with_account(1, "a=", "A")
            .with_account(2, "b=", "B")
            .with_member(OFFICERS, 2);
        let forum = FakeForum::new().with_account(FakeForumAccount::new(100, "a", "a=", &[5]));
        let h = harness(chat, forum, officers_map()).await;

        let first = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert!(first.has_changes());
        let second = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(second.added_count, 0);
        assert_eq!(second.removed_count, 0);
    }

    #[tokio::test]
    async fn check_only_never_mutates() {
        let chat = FakeChat::new()
            .with_account(1, "a=", "A")
            .with_account(2, "b=", "B")
            .with_member(OFFICERS, 2);
        let forum = FakeForum::new().with_account(FakeForumAccount::new(100, "a", "a=", &[5]));
        let h = harness(chat, forum, officers_map()).await;

        let report = h.reconciler.run_sync(SyncMode::CheckOnly).await.unwrap();
        assert_eq!(report.added_count, 1);
        assert_eq!(report.removed_count, 1);
        assert_eq!(h.chat.add_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.chat.remove_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.chat.members_of(OFFICERS), vec![2]);
        assert!(report.summary().ends_with("(check only)"));
    }

    #[tokio::test]
    async fn case_insensitive_near_match_is_rejected() {
        let chat = FakeChat::new().with_account(7, "AbC=", "Near");
        let forum =
            FakeForum::new().with_account(FakeForumAccount::new(100, "abc", "abc=", &[5]));
        let h = harness(chat, forum, officers_map()).await;

        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(report.added_count, 0);
        assert_eq!(report.missing_account_count, 0);
        assert_eq!(report.mismatch_count, 1);
        assert!(report.groups[0].mismatches[0].contains("AbC="));
        assert_eq!(h.chat.add_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_identity_in_member_mapping_counted_once() {
        let chat = FakeChat::new().with_account(1, "dup=", "Dup");
        let forum = FakeForum::new()
            .with_account(FakeForumAccount::new(100, "first", "dup=", &[1]))
            .with_account(FakeForumAccount::new(101, "second", "dup=", &[1]))
            .with_account(FakeForumAccount::new(102, "third", "dup=", &[1]));
        let mut map = GroupMap::new();
        map.insert("Member".into(), mapping(MEMBERS, &[1]));
        let h = harness(chat, forum, map).await;

        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(report.duplicate_count, 2);
        assert_eq!(report.added_count, 1);
        assert!(report.groups[0].duplicates[0].ends_with("First seen user first"));
        assert_eq!(h.chat.members_of(MEMBERS), vec![1]);
    }

    #[tokio::test]
    async fn duplicate_across_member_mappings_is_not_added_twice() {
        let chat = FakeChat::new()
            .with_group(31, "Guest")
            .with_account(1, "x=", "X");
        let forum = FakeForum::new()
            .with_account(FakeForumAccount::new(100, "member", "x=", &[1]))
            .with_account(FakeForumAccount::new(101, "guest", "x=", &[2]));
        let mut map = GroupMap::new();
        map.insert("Guest".into(), mapping(31, &[2]));
        map.insert("Member".into(), mapping(MEMBERS, &[1]));
        let h = harness(chat, forum, map).await;
        {
            let mut s = (*h.reconciler.settings.current()).clone();
            s.tiers.member = vec![MEMBERS, 31];
            h.reconciler.settings.replace(s);
        }

        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(report.duplicate_count, 1);
        assert_eq!(report.added_count, 1);
        // "Guest" sorts first, so it holds the first-seen entry.
        assert_eq!(h.chat.members_of(31), vec![1]);
        assert!(h.chat.members_of(MEMBERS).is_empty());
    }

    #[tokio::test]
    async fn pending_members_are_reported_not_added_and_not_protected() {
        let chat = FakeChat::new()
            .with_account(1, "p=", "Pending")
            .with_account(2, "q=", "InGroup")
            .with_member(MEMBERS, 2);
        let forum = FakeForum::new()
            .with_account(FakeForumAccount::new(100, "p", "p=", &[1]).pending())
            .with_account(FakeForumAccount::new(101, "q", "q=", &[1]).pending());
        let mut map = GroupMap::new();
        map.insert("Member".into(), mapping(MEMBERS, &[1]));
        let h = harness(chat, forum, map).await;

        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(report.added_count, 0);
        assert_eq!(report.removed_count, 1);
        assert_eq!(report.groups[0].pending, vec!["p= (p)".to_string()]);
        assert!(h.chat.members_of(MEMBERS).is_empty());
    }

    #[tokio::test]
    async fn pending_duplicate_does_not_evict_active_member() {
        let chat = FakeChat::new()
            .with_account(1, "x=", "Real")
            .with_member(MEMBERS, 1);
        let forum = FakeForum::new()
            .with_account(FakeForumAccount::new(100, "alt", "x=", &[1]).pending())
            .with_account(FakeForumAccount::new(101, "real", "x=", &[1]));
        let mut map = GroupMap::new();
        map.insert("Member".into(), mapping(MEMBERS, &[1]));
        let h = harness(chat, forum, map).await;

        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(report.removed_count, 0);
        assert!(report.groups[0].removed.is_empty());
        assert_eq!(
            report.groups[0].duplicates,
            vec!["x= (alt) -- First seen user real".to_string()]
        );
        assert_eq!(h.chat.members_of(MEMBERS), vec![1]);
        assert_eq!(h.chat.remove_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_mapping_does_not_abort_cycle() {
        let chat = FakeChat::new()
            .with_account(1, "a=", "A")
            .with_account(2, "m=", "M");
        let forum = FakeForum::new()
            .with_account(FakeForumAccount::new(100, "a", "a=", &[5]))
            .with_account(FakeForumAccount::new(101, "m", "m=", &[1]));
        let mut map = officers_map();
        map.insert("Member".into(), mapping(MEMBERS, &[1]));
        let h = harness(chat, forum, map).await;
        h.forum.fail_group(5);

        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(report.failed_mappings.len(), 1);
        assert_eq!(report.failed_mappings[0].group_name, "Alpha Officer");
        assert_eq!(report.added_count, 1);
        assert_eq!(h.chat.members_of(MEMBERS), vec![2]);
        assert!(h.audit.sync_text().contains("Sync Alpha Officer failed"));
    }

    #[tokio::test]
    async fn failed_add_is_reported_and_cycle_continues() {
        let chat = FakeChat::new()
            .with_account(1, "a=", "A")
            .with_account(2, "b=", "B");
        let forum = FakeForum::new()
            .with_account(FakeForumAccount::new(100, "a", "a=", &[5]))
            .with_account(FakeForumAccount::new(101, "b", "b=", &[5]));
        let h = harness(chat, forum, officers_map()).await;
        h.chat.fail_add_for(1);

        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(report.added_count, 1);
        assert_eq!(report.groups[0].failures.len(), 1);
        assert_eq!(h.chat.members_of(OFFICERS), vec![2]);
    }

    #[tokio::test]
    async fn duplicate_in_secondary_mapping_is_logged_not_reported() {
        let chat = FakeChat::new().with_account(1, "d=", "D");
        let forum = FakeForum::new()
            .with_account(FakeForumAccount::new(100, "first", "d=", &[5]))
            .with_account(FakeForumAccount::new(101, "second", "d=", &[5]));
        let h = harness(chat, forum, officers_map()).await;

        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert_eq!(report.duplicate_count, 0);
        assert!(report.failed_mappings.is_empty());
        assert_eq!(report.groups[0].added, vec!["d= (first)".to_string()]);
        assert_eq!(h.chat.members_of(OFFICERS), vec![1]);
    }

    #[tokio::test]
    async fn concurrent_cycle_is_rejected() {
        let h = harness(FakeChat::new(), FakeForum::new(), officers_map()).await;
        let _held = h.reconciler.begin().unwrap();
        assert_eq!(
            h.reconciler.run_sync(SyncMode::Apply).await,
            Err(DomainError::SyncAlreadyRunning)
        );
        drop(_held);
        assert!(h.reconciler.run_sync(SyncMode::Apply).await.is_ok());
        // The guard was released when the cycle ended.
        assert!(h.reconciler.begin().is_ok());
    }

    #[tokio::test]
    async fn shutdown_cancels_before_next_mapping() {
        let h = harness(FakeChat::new(), FakeForum::new(), officers_map()).await;
        h.shutdown.send(true).unwrap();
        let report = h.reconciler.run_sync(SyncMode::Apply).await.unwrap();
        assert!(report.cancelled);
        assert!(report.groups.is_empty());
    }

    #[tokio::test]
    async fn audit_trail_lists_changes() {
        let chat = FakeChat::new().with_account(1, "a=", "A");
        let forum = FakeForum::new().with_account(FakeForumAccount::new(100, "a", "a=", &[5]));
        let h = harness(chat, forum, officers_map()).await;
        h.reconciler.run_sync(SyncMode::Apply).await.unwrap();

        let log = h.audit.sync_text();
        assert!(log.contains("Forum sync started"));
        assert!(log.contains("Sync Alpha Officer"));
        assert!(log.contains("\tMembers to add (1):\n\t\ta= (a)"));
        assert!(log.contains("1 groups added"));
        assert!(h.audit.population.lock().unwrap().contains("12/64"));
    }

    #[tokio::test]
    async fn apply_mappings_for_grants_missing_groups() {
        let chat = FakeChat::new()
            .with_account(1, "me=", "Me")
            .with_member(MEMBERS, 1);
        let forum =
            FakeForum::new().with_account(FakeForumAccount::new(100, "me", "me=", &[5, 1]));
        let mut map = officers_map();
        map.insert("Member".into(), mapping(MEMBERS, &[1]));
        let h = harness(chat, forum, map).await;

        let granted = h.reconciler.apply_mappings_for("me=").await.unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].id, OFFICERS);
        assert_eq!(h.chat.members_of(OFFICERS), vec![1]);
        assert_eq!(h.chat.add_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn apply_mappings_for_rejects_ambiguous_identity() {
        let forum = FakeForum::new()
            .with_account(FakeForumAccount::new(100, "a", "same=", &[5]))
            .with_account(FakeForumAccount::new(101, "b", "same=", &[5]));
        let h = harness(FakeChat::new(), forum, officers_map()).await;
        assert!(matches!(
            h.reconciler.apply_mappings_for("same=").await,
            Err(DomainError::AmbiguousAccount { count: 2, .. })
        ));
        assert_eq!(h.chat.mutations(), 0);
    }

    #[test]
    fn chat_lines_truncate_long_lists() {
        let mut report = SyncReport::new(SyncMode::Apply);
        let mut detail = GroupSyncDetail::new("Alpha Officer", OFFICERS);
        detail.added = (0..500).map(|i| format!("id{}=", i)).collect();
        report.push(detail);
        let lines = report.chat_lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Sync Alpha Officer: Members to add (500): "));
        assert!(lines[0].ends_with(" ..."));
        assert!(lines[1].contains("500 groups added"));
    }
}
