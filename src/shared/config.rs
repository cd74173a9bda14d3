//! Application configuration. Connection credentials, permission groups, paths, limits.

use crate::domain::{ChatGroupId, DomainError, TierGroups};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Keys parsed as comma separated lists when read from the environment.
const LIST_KEYS: &[&str] = &[
    "owner_unique_ids",
    "admin_groups",
    "staff_groups",
    "division_command_groups",
    "mod_groups",
    "recruiter_groups",
    "member_groups",
    "guest_groups",
];

#[derive(Debug, Deserialize, Default, Clone)]
pub struct AppConfig {
    // ─────────────────────────────────────────────────────────────────────────
    // TeamSpeak ServerQuery
    // ─────────────────────────────────────────────────────────────────────────
    pub host: Option<String>,
    /// ServerQuery port (default 10011).
    pub query_port: Option<u16>,
    /// Virtual server voice port selected with `use` (default 9987).
    pub server_port: Option<u16>,
    pub query_username: Option<String>,
    pub query_password: Option<String>,
    pub nickname: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Commands and permissions
    // ─────────────────────────────────────────────────────────────────────────
    /// Command prefix (default "!").
    pub prefix: Option<String>,
    /// Unique identifiers always treated as Owner.
    #[serde(default)]
    pub owner_unique_ids: Vec<String>,
    #[serde(default)]
    pub admin_groups: Vec<ChatGroupId>,
    #[serde(default)]
    pub staff_groups: Vec<ChatGroupId>,
    #[serde(default)]
    pub division_command_groups: Vec<ChatGroupId>,
    #[serde(default)]
    pub mod_groups: Vec<ChatGroupId>,
    #[serde(default)]
    pub recruiter_groups: Vec<ChatGroupId>,
    /// Member groups. Mappings onto these groups are primary-membership mappings.
    #[serde(default)]
    pub member_groups: Vec<ChatGroupId>,
    #[serde(default)]
    pub guest_groups: Vec<ChatGroupId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Group map
    // ─────────────────────────────────────────────────────────────────────────
    /// Only server groups ending with this suffix may be mapped (default " Officer").
    pub ts_officer_suffix: Option<String>,
    /// Only forum groups ending with this suffix may be mapped (default " Officers").
    pub forum_officer_suffix: Option<String>,
    pub group_map_path: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Files
    // ─────────────────────────────────────────────────────────────────────────
    pub data_dir: Option<String>,
    pub sync_log_file: Option<String>,
    pub population_log_file: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Forum store
    // ─────────────────────────────────────────────────────────────────────────
    /// Remote libsql/sqld URL. Takes precedence over `forum_db_path`.
    pub forum_db_url: Option<String>,
    pub forum_db_token: Option<String>,
    /// Local database file.
    pub forum_db_path: Option<String>,
    pub forum_table_prefix: Option<String>,
    pub forum_requests_table: Option<String>,
    /// userfield column holding the linked TeamSpeak identity (default "field18").
    pub forum_identity_field: Option<String>,
    /// userfield column holding the division (default "field13").
    pub forum_division_field: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Limits
    // ─────────────────────────────────────────────────────────────────────────
    pub max_login_attempts: Option<u32>,
    pub login_error_timeout_ms: Option<u64>,
    pub sync_interval_ms: Option<u64>,
    /// Upper bound for every external call.
    pub call_timeout_ms: Option<u64>,
    pub store_retry_attempts: Option<u32>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenv::dotenv().ok();
        let mut env = config::Environment::with_prefix("TSFS")
            .try_parsing(true)
            .list_separator(",");
        for key in LIST_KEYS {
            env = env.with_list_parse_key(key);
        }
        let mut c = config::Config::builder();
        if let Ok(path) = std::env::var("TSFS_CONFIG") {
            c = c.add_source(config::File::with_name(&path));
        }
        c = c.add_source(env);
        c.build()?.try_deserialize()
    }

    pub fn host_or_default(&self) -> String {
        self.host.clone().unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn query_port_or_default(&self) -> u16 {
        self.query_port.unwrap_or(10011)
    }

    pub fn server_port_or_default(&self) -> u16 {
        self.server_port.unwrap_or(9987)
    }

    pub fn nickname_or_default(&self) -> String {
        self.nickname.clone().unwrap_or_else(|| "ForumSync".to_string())
    }

    pub fn data_dir_or_default(&self) -> PathBuf {
        PathBuf::from(self.data_dir.as_deref().unwrap_or("./data"))
    }

    /// Relative paths are resolved against the data directory.
    fn data_file(&self, configured: Option<&str>, default: &str) -> PathBuf {
        let p = PathBuf::from(configured.unwrap_or(default));
        if p.is_absolute() {
            p
        } else {
            self.data_dir_or_default().join(p)
        }
    }

    pub fn group_map_path_or_default(&self) -> PathBuf {
        self.data_file(self.group_map_path.as_deref(), "group-map.json")
    }

    pub fn sync_log_path_or_default(&self) -> PathBuf {
        self.data_file(self.sync_log_file.as_deref(), "sync.log")
    }

    pub fn population_log_path_or_default(&self) -> PathBuf {
        self.data_file(self.population_log_file.as_deref(), "population.log")
    }

    pub fn forum_db_path_or_default(&self) -> PathBuf {
        self.data_file(self.forum_db_path.as_deref(), "forum.db")
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.unwrap_or(15_000))
    }

    pub fn store_retry_attempts_or_default(&self) -> u32 {
        self.store_retry_attempts.unwrap_or(3).max(1)
    }
}

/// Live settings used by the use cases. Rebuilt on `reload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotSettings {
    pub prefix: String,
    pub tiers: TierGroups,
    pub ts_officer_suffix: String,
    pub forum_officer_suffix: String,
    pub max_login_attempts: u32,
    pub login_error_timeout_ms: i64,
    pub sync_interval: Duration,
}

impl BotSettings {
    pub fn from_config(cfg: &AppConfig) -> Result<Self, DomainError> {
        let defaults = Self::default();
        let prefix = cfg.prefix.clone().unwrap_or(defaults.prefix);
        if prefix.trim().is_empty() {
            return Err(DomainError::Config("prefix must not be empty".into()));
        }
        let ts_officer_suffix = cfg
            .ts_officer_suffix
            .clone()
            .unwrap_or(defaults.ts_officer_suffix);
        let forum_officer_suffix = cfg
            .forum_officer_suffix
            .clone()
            .unwrap_or(defaults.forum_officer_suffix);
        if ts_officer_suffix.is_empty() || forum_officer_suffix.is_empty() {
            return Err(DomainError::Config(
                "officer suffixes must not be empty".into(),
            ));
        }
        let login_error_timeout_ms = match cfg.login_error_timeout_ms {
            Some(ms) => i64::try_from(ms)
                .map_err(|_| DomainError::Config("login_error_timeout_ms out of range".into()))?,
            None => defaults.login_error_timeout_ms,
        };
        let sync_interval = match cfg.sync_interval_ms {
            Some(0) => {
                return Err(DomainError::Config("sync_interval_ms must be positive".into()));
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.sync_interval,
        };

        Ok(Self {
            prefix,
            tiers: TierGroups {
                owner_unique_ids: cfg.owner_unique_ids.clone(),
                admin: cfg.admin_groups.clone(),
                staff: cfg.staff_groups.clone(),
                division_command: cfg.division_command_groups.clone(),
                moderator: cfg.mod_groups.clone(),
                recruiter: cfg.recruiter_groups.clone(),
                member: cfg.member_groups.clone(),
                guest: cfg.guest_groups.clone(),
            },
            ts_officer_suffix,
            forum_officer_suffix,
            max_login_attempts: cfg
                .max_login_attempts
                .unwrap_or(defaults.max_login_attempts),
            login_error_timeout_ms,
            sync_interval,
        })
    }

    /// Mappings onto member groups include pending accounts and track duplicates.
    pub fn is_member_group(&self, sgid: ChatGroupId) -> bool {
        self.tiers.member.contains(&sgid)
    }

    /// Cooldown rounded to whole minutes for user messages.
    pub fn login_cooldown_minutes(&self) -> u64 {
        ((self.login_error_timeout_ms as f64) / 60_000.0).round() as u64
    }
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            prefix: "!".to_string(),
            tiers: TierGroups::default(),
            ts_officer_suffix: " Officer".to_string(),
            forum_officer_suffix: " Officers".to_string(),
            max_login_attempts: 3,
            login_error_timeout_ms: 5 * 60 * 1000,
            sync_interval: Duration::from_millis(15 * 60 * 1000),
        }
    }
}

/// Swappable snapshot of `BotSettings`, shared by every use case.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<Arc<BotSettings>>>,
}

impl SharedSettings {
    pub fn new(settings: BotSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// Current snapshot. Cheap; holders keep a consistent view across awaits.
    pub fn current(&self) -> Arc<BotSettings> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, settings: BotSettings) {
        let next = Arc::new(settings);
        match self.inner.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}
