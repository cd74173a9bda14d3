//! Forum membership store via libsql. Implements ForumStore.
//!
//! Reads the forum's user, usergroup and userfield tables plus the member request table.
//! Table prefix and profile field names come from configuration and are validated as
//! identifiers before being placed in SQL; every caller-supplied value is a bound parameter.
//!
//! The connection is cached and dropped after any failed statement, so the next call
//! reconnects.

use crate::domain::{DomainError, ForumGroup, ForumGroupId, ForumMember, LinkedAccount, VerifiedAccount};
use crate::ports::ForumStore;
use libsql::{params, Connection, Database, Value};
use md5::{Digest, Md5};
use std::future::Future;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Table and column names of the forum schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForumSchema {
    pub table_prefix: String,
    pub requests_table: String,
    pub identity_field: String,
    pub division_field: String,
}

impl Default for ForumSchema {
    fn default() -> Self {
        Self {
            table_prefix: String::new(),
            requests_table: "member_requests".to_string(),
            identity_field: "field18".to_string(),
            division_field: "field13".to_string(),
        }
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ForumSchema {
    pub fn validate(&self) -> Result<(), DomainError> {
        let prefix_ok = self
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !prefix_ok {
            return Err(DomainError::Config(format!(
                "invalid forum table prefix: {}",
                self.table_prefix
            )));
        }
        for (key, value) in [
            ("forum_requests_table", &self.requests_table),
            ("forum_identity_field", &self.identity_field),
            ("forum_division_field", &self.division_field),
        ] {
            if !is_identifier(value) {
                return Err(DomainError::Config(format!("invalid {}: {}", key, value)));
            }
        }
        Ok(())
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.table_prefix, name)
    }
}

/// Where the forum database lives.
#[derive(Debug, Clone)]
pub enum ForumSource {
    Local(std::path::PathBuf),
    Remote { url: String, token: String },
}

fn store_err(e: libsql::Error) -> DomainError {
    DomainError::StoreUnavailable(e.to_string())
}

/// Parse `usergroupid` + comma separated `membergroupids`.
fn parse_groups(primary: Option<i64>, secondary: Option<&str>) -> Vec<ForumGroupId> {
    let mut groups: Vec<ForumGroupId> = primary.into_iter().collect();
    for id in secondary
        .unwrap_or("")
        .split(',')
        .filter_map(|s| s.trim().parse::<ForumGroupId>().ok())
    {
        if !groups.contains(&id) {
            groups.push(id);
        }
    }
    groups
}

pub struct LibsqlForumStore {
    db: Database,
    schema: ForumSchema,
    conn: Mutex<Option<Connection>>,
}

impl LibsqlForumStore {
    pub async fn connect(source: &ForumSource, schema: ForumSchema) -> Result<Self, DomainError> {
        schema.validate()?;
        let db = match source {
            ForumSource::Local(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)
                        .map_err(|e| DomainError::StoreUnavailable(e.to_string()))?;
                }
                libsql::Builder::new_local(path.as_path())
                    .build()
                    .await
                    .map_err(store_err)?
            }
            ForumSource::Remote { url, token } => {
                libsql::Builder::new_remote(url.clone(), token.clone())
                    .build()
                    .await
                    .map_err(store_err)?
            }
        };
        let store = Self {
            db,
            schema,
            conn: Mutex::new(None),
        };
        store.connection().await?;
        match source {
            ForumSource::Local(path) => info!(path = %path.display(), "forum store connected"),
            ForumSource::Remote { url, .. } => info!(url = %url, "forum store connected"),
        }
        Ok(store)
    }

    pub async fn open_local(path: impl AsRef<Path>, schema: ForumSchema) -> Result<Self, DomainError> {
        Self::connect(&ForumSource::Local(path.as_ref().to_path_buf()), schema).await
    }

    async fn connection(&self) -> Result<Connection, DomainError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.db.connect().map_err(store_err)?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Run `f` on the cached connection; a store failure drops the connection.
    async fn with_conn<T, F, Fut>(&self, f: F) -> Result<T, DomainError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let conn = self.connection().await?;
        let result = f(conn).await;
        if let Err(DomainError::StoreUnavailable(e)) = &result {
            warn!(error = %e, "forum store query failed; dropping connection");
            *self.conn.lock().await = None;
        }
        result
    }

    fn linked_accounts_sql(&self, exclude: bool) -> String {
        let mut sql = format!(
            "SELECT u.userid, u.username, u.usergroupid, u.membergroupids \
             FROM {user} u INNER JOIN {field} f ON f.userid = u.userid \
             WHERE f.{identity} = ?1",
            user = self.schema.table("user"),
            field = self.schema.table("userfield"),
            identity = self.schema.identity_field,
        );
        if exclude {
            sql.push_str(" AND u.userid != ?2");
        }
        sql.push_str(" ORDER BY u.userid");
        sql
    }

    async fn query_linked(&self, sql: String, params: Vec<Value>) -> Result<Vec<LinkedAccount>, DomainError> {
        self.with_conn(|conn| async move {
            let mut rows = conn
                .query(&sql, libsql::params_from_iter(params))
                .await
                .map_err(store_err)?;
            let mut accounts = Vec::new();
            while let Some(row) = rows.next().await.map_err(store_err)? {
                let account_id: i64 = row.get(0).map_err(store_err)?;
                let username: String = row.get(1).map_err(store_err)?;
                let primary: Option<i64> = row.get(2).ok();
                let secondary: Option<String> = row.get(3).ok();
                accounts.push(LinkedAccount {
                    account_id,
                    username,
                    groups: parse_groups(primary, secondary.as_deref()),
                });
            }
            Ok::<_, DomainError>(accounts)
        })
        .await
    }
}

#[async_trait::async_trait]
impl ForumStore for LibsqlForumStore {
    async fn list_groups(&self) -> Result<Vec<ForumGroup>, DomainError> {
        let sql = format!(
            "SELECT usergroupid, title FROM {} ORDER BY title",
            self.schema.table("usergroup")
        );
        self.with_conn(|conn| async move {
            let mut rows = conn.query(&sql, ()).await.map_err(store_err)?;
            let mut groups = Vec::new();
            while let Some(row) = rows.next().await.map_err(store_err)? {
                groups.push(ForumGroup {
                    id: row.get(0).map_err(store_err)?,
                    name: row.get::<String>(1).unwrap_or_default(),
                });
            }
            Ok::<_, DomainError>(groups)
        })
        .await
    }

    async fn list_members_for_groups(
        &self,
        group_ids: &[ForumGroupId],
        include_pending: bool,
    ) -> Result<Vec<ForumMember>, DomainError> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let n = group_ids.len();
        let in_list = (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ");
        let secondary = (1..=n)
            .map(|i| format!("(',' || COALESCE(u.membergroupids, '') || ',') LIKE ('%,' || ?{} || ',%')", i))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "SELECT u.userid, u.username, f.{identity}, f.{division}, \
             (CASE WHEN r.requester_id IS NOT NULL AND r.approver_id IS NULL THEN 1 ELSE 0 END) AS pending \
             FROM {user} u \
             INNER JOIN {field} f ON f.userid = u.userid \
             LEFT JOIN {requests} r ON r.member_id = u.userid AND r.approver_id IS NULL \
             WHERE (u.usergroupid IN ({in_list}) OR {secondary} \
                    OR (?{pending_param} = 1 AND r.requester_id IS NOT NULL)) \
               AND TRIM(COALESCE(f.{identity}, '')) <> '' \
             ORDER BY f.{division}, u.username",
            identity = self.schema.identity_field,
            division = self.schema.division_field,
            user = self.schema.table("user"),
            field = self.schema.table("userfield"),
            requests = self.schema.requests_table,
            in_list = in_list,
            secondary = secondary,
            pending_param = n + 1,
        );
        let mut params: Vec<Value> = group_ids.iter().map(|g| Value::Integer(*g)).collect();
        params.push(Value::Integer(i64::from(include_pending)));

        self.with_conn(|conn| async move {
            let mut rows = conn
                .query(&sql, libsql::params_from_iter(params))
                .await
                .map_err(store_err)?;
            let mut members = Vec::new();
            while let Some(row) = rows.next().await.map_err(store_err)? {
                let identity: String = row.get::<String>(2).unwrap_or_default();
                let pending: i64 = row.get(4).map_err(store_err)?;
                members.push(ForumMember {
                    account_id: row.get(0).map_err(store_err)?,
                    name: row.get::<String>(1).unwrap_or_default(),
                    identity: identity.trim().to_string(),
                    division: row.get::<String>(3).ok(),
                    pending: pending != 0,
                });
            }
            Ok::<_, DomainError>(members)
        })
        .await
    }

    /// Matches on username or email; the stored password is `md5(secret_hash || salt)`.
    async fn verify_credential(
        &self,
        username: &str,
        secret_hash: &str,
    ) -> Result<Option<VerifiedAccount>, DomainError> {
        let sql = format!(
            "SELECT userid, username, password, salt FROM {} \
             WHERE username = ?1 OR email = ?1 ORDER BY userid LIMIT 1",
            self.schema.table("user")
        );
        let username = username.to_string();
        let secret_hash = secret_hash.to_string();
        self.with_conn(|conn| async move {
            let mut rows = conn
                .query(&sql, params![username])
                .await
                .map_err(store_err)?;
            let Some(row) = rows.next().await.map_err(store_err)? else {
                return Ok(None);
            };
            let stored: String = row.get::<String>(2).unwrap_or_default();
            let salt: String = row.get::<String>(3).unwrap_or_default();
            let salted = format!("{:x}", Md5::digest(format!("{}{}", secret_hash, salt).as_bytes()));
            Ok::<_, DomainError>(Some(VerifiedAccount {
                account_id: row.get(0).map_err(store_err)?,
                username: row.get::<String>(1).unwrap_or_default(),
                valid: !stored.is_empty() && stored.eq_ignore_ascii_case(&salted),
            }))
        })
        .await
    }

    async fn set_linked_identity(&self, account_id: i64, identity: &str) -> Result<(), DomainError> {
        let field = self.schema.table("userfield");
        let update = format!(
            "UPDATE {} SET {} = ?1 WHERE userid = ?2",
            field, self.schema.identity_field
        );
        let insert = format!(
            "INSERT INTO {} (userid, {}) VALUES (?1, ?2)",
            field, self.schema.identity_field
        );
        let identity = identity.to_string();
        self.with_conn(|conn| async move {
            let changed = conn
                .execute(&update, params![identity.as_str(), account_id])
                .await
                .map_err(store_err)?;
            if changed == 0 {
                conn.execute(&insert, params![account_id, identity.as_str()])
                    .await
                    .map_err(store_err)?;
            }
            Ok::<_, DomainError>(())
        })
        .await
    }

    async fn clear_linked_identity(&self, account_id: i64) -> Result<(), DomainError> {
        let sql = format!(
            "UPDATE {} SET {} = '' WHERE userid = ?1",
            self.schema.table("userfield"),
            self.schema.identity_field
        );
        self.with_conn(|conn| async move {
            conn.execute(&sql, params![account_id])
                .await
                .map_err(store_err)?;
            Ok::<_, DomainError>(())
        })
        .await
    }

    async fn find_conflicting_links(
        &self,
        identity: &str,
        excluding_account_id: i64,
    ) -> Result<Vec<LinkedAccount>, DomainError> {
        let sql = self.linked_accounts_sql(true);
        self.query_linked(
            sql,
            vec![
                Value::Text(identity.to_string()),
                Value::Integer(excluding_account_id),
            ],
        )
        .await
    }

    async fn find_accounts_by_identity(&self, identity: &str) -> Result<Vec<LinkedAccount>, DomainError> {
        let sql = self.linked_accounts_sql(false);
        self.query_linked(sql, vec![Value::Text(identity.to_string())])
            .await
    }
}
