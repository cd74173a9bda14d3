//! ServerQuery client implementing `ChatDirectory` and `ChatMessenger`.
//!
//! Holds the current session behind a lock so the supervisor can reconnect without
//! rebuilding the use cases that share this client.

use super::codec::{Command, ERROR_DUPLICATE_ENTRY, Notification};
use super::connection::{EventStream, QueryConnection};
use super::mapper;
use crate::domain::{
    ChatAccount, ChatGroup, ChatGroupId, ChatGroupMember, DomainError, Invoker, Population,
};
use crate::ports::{ChatDirectory, ChatMessenger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Private text message target mode.
const TARGET_CLIENT: u8 = 1;

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub host: String,
    pub query_port: u16,
    pub server_port: u16,
    /// Empty: skip `login` (anonymous query client).
    pub username: String,
    pub password: String,
    pub nickname: String,
    pub call_timeout: Duration,
    pub keepalive: Duration,
}

struct Session {
    conn: Arc<QueryConnection>,
    own_client_id: u64,
}

pub struct TeamSpeakClient {
    settings: QuerySettings,
    session: RwLock<Option<Session>>,
}

impl TeamSpeakClient {
    pub fn new(settings: QuerySettings) -> Self {
        Self {
            settings,
            session: RwLock::new(None),
        }
    }

    /// Open a new session, replacing any current one. Returns its event stream.
    pub async fn connect(&self) -> Result<EventStream, DomainError> {
        let addr = format!("{}:{}", self.settings.host, self.settings.query_port);
        let (conn, events) =
            QueryConnection::connect(&addr, self.settings.call_timeout, self.settings.keepalive)
                .await?;
        self.attach(conn).await?;
        info!(addr = %addr, server_port = self.settings.server_port, "Connected to ServerQuery");
        Ok(events)
    }

    /// Log in, select the virtual server and subscribe to private messages.
    async fn attach(&self, conn: QueryConnection) -> Result<(), DomainError> {
        if !self.settings.username.is_empty() {
            conn.records(
                &Command::new("login")
                    .arg("client_login_name", &self.settings.username)
                    .arg("client_login_password", &self.settings.password),
            )
            .await?;
        }
        conn.records(&Command::new("use").arg("port", self.settings.server_port))
            .await?;

        let rename = Command::new("clientupdate").arg("client_nickname", &self.settings.nickname);
        let reply = conn.execute(&rename).await?;
        if !reply.status.is_ok() {
            warn!(nickname = %self.settings.nickname, status = %reply.status, "Nickname not applied");
        }

        conn.records(&Command::new("servernotifyregister").arg("event", "textprivate"))
            .await?;

        let own_client_id = conn
            .records(&Command::new("whoami"))
            .await?
            .first()
            .and_then(|r| r.parse_field::<u64>("client_id"))
            .ok_or_else(|| DomainError::ChatUnavailable("whoami without client_id".into()))?;

        *self.session.write().await = Some(Session {
            conn: Arc::new(conn),
            own_client_id,
        });
        Ok(())
    }

    /// Drop the current session. Calls fail with `ChatUnavailable` until the next `connect`.
    pub async fn disconnect(&self) {
        if self.session.write().await.take().is_some() {
            debug!("ServerQuery session dropped");
        }
    }

    async fn conn(&self) -> Result<Arc<QueryConnection>, DomainError> {
        match self.session.read().await.as_ref() {
            Some(s) if !s.conn.is_closed() => Ok(s.conn.clone()),
            _ => Err(DomainError::ChatUnavailable("not connected".into())),
        }
    }

    async fn own_client_id(&self) -> Option<u64> {
        self.session.read().await.as_ref().map(|s| s.own_client_id)
    }

    /// Next private text message from another client. `None` when the session has ended.
    ///
    /// Senders that cannot be resolved are logged and skipped.
    pub async fn next_message(&self, events: &mut EventStream) -> Option<(Invoker, String)> {
        while let Some(event) = events.recv().await {
            if let Some(message) = self.private_message(&event).await {
                return Some(message);
            }
        }
        None
    }

    async fn private_message(&self, event: &Notification) -> Option<(Invoker, String)> {
        if event.event != "notifytextmessage"
            || event.record.parse_field::<u8>("targetmode") != Some(TARGET_CLIENT)
        {
            return None;
        }
        let client_id: u64 = event.record.parse_field("invokerid")?;
        if self.own_client_id().await == Some(client_id) {
            return None;
        }
        let text = event.record.get("msg").unwrap_or_default().to_string();

        match self.resolve_invoker(client_id).await {
            Ok(Some(invoker)) => Some((invoker, text)),
            Ok(None) => {
                warn!(client_id, "Message sender left before it could be resolved");
                None
            }
            Err(e) => {
                warn!(client_id, error = %e, "Failed to resolve message sender");
                None
            }
        }
    }

    async fn resolve_invoker(&self, client_id: u64) -> Result<Option<Invoker>, DomainError> {
        let conn = self.conn().await?;
        let records = conn
            .records(&Command::new("clientinfo").arg("clid", client_id))
            .await?;
        Ok(records.first().and_then(|r| mapper::invoker(client_id, r)))
    }
}

#[async_trait::async_trait]
impl ChatDirectory for TeamSpeakClient {
    async fn list_group_members(
        &self,
        group_id: ChatGroupId,
    ) -> Result<Vec<ChatGroupMember>, DomainError> {
        let conn = self.conn().await?;
        let records = conn
            .records(
                &Command::new("servergroupclientlist")
                    .arg("sgid", group_id)
                    .flag("names"),
            )
            .await?;
        Ok(records.iter().filter_map(mapper::group_member).collect())
    }

    /// `clientdbfind` is case-insensitive and may return several records. The one whose
    /// identity matches exactly wins; otherwise the first record is returned.
    async fn find_account_by_identity(
        &self,
        identity: &str,
    ) -> Result<Option<ChatAccount>, DomainError> {
        let conn = self.conn().await?;
        let db_ids: Vec<u64> = conn
            .records(
                &Command::new("clientdbfind")
                    .arg("pattern", identity)
                    .flag("uid"),
            )
            .await?
            .iter()
            .filter_map(|r| r.parse_field::<u64>("cldbid"))
            .collect();
        let mut fallback = None;
        for db_id in db_ids {
            let Some(account) = self.get_account_detail(db_id).await? else {
                continue;
            };
            if account.identity == identity {
                return Ok(Some(account));
            }
            fallback.get_or_insert(account);
        }
        Ok(fallback)
    }

    async fn get_account_detail(&self, db_id: u64) -> Result<Option<ChatAccount>, DomainError> {
        let conn = self.conn().await?;
        let records = conn
            .records(&Command::new("clientdbinfo").arg("cldbid", db_id))
            .await?;
        Ok(records.first().and_then(|r| mapper::db_account(db_id, r)))
    }

    async fn add_account_to_group(
        &self,
        db_id: u64,
        group_id: ChatGroupId,
    ) -> Result<(), DomainError> {
        let conn = self.conn().await?;
        let command = Command::new("servergroupaddclient")
            .arg("sgid", group_id)
            .arg("cldbid", db_id);
        let reply = conn.execute(&command).await?;
        if reply.status.id == ERROR_DUPLICATE_ENTRY {
            debug!(db_id, sgid = group_id, "Already a group member");
            return Ok(());
        }
        reply.into_records(command.name()).map(|_| ())
    }

    async fn remove_account_from_group(
        &self,
        db_id: u64,
        group_id: ChatGroupId,
    ) -> Result<(), DomainError> {
        let conn = self.conn().await?;
        conn.records(
            &Command::new("servergroupdelclient")
                .arg("sgid", group_id)
                .arg("cldbid", db_id),
        )
        .await
        .map(|_| ())
    }

    async fn list_groups(&self) -> Result<Vec<ChatGroup>, DomainError> {
        let conn = self.conn().await?;
        let records = conn.records(&Command::new("servergrouplist")).await?;
        Ok(records.iter().filter_map(mapper::server_group).collect())
    }

    async fn get_group_by_name(&self, name: &str) -> Result<Option<ChatGroup>, DomainError> {
        Ok(self.list_groups().await?.into_iter().find(|g| g.name == name))
    }

    async fn get_group_by_id(&self, id: ChatGroupId) -> Result<Option<ChatGroup>, DomainError> {
        Ok(self.list_groups().await?.into_iter().find(|g| g.id == id))
    }

    async fn groups_for_account(&self, db_id: u64) -> Result<Vec<ChatGroupId>, DomainError> {
        let conn = self.conn().await?;
        let records = conn
            .records(&Command::new("servergroupsbyclientid").arg("cldbid", db_id))
            .await?;
        Ok(records.iter().filter_map(|r| r.parse_field("sgid")).collect())
    }

    async fn population(&self) -> Result<Population, DomainError> {
        let conn = self.conn().await?;
        let records = conn.records(&Command::new("serverinfo")).await?;
        records
            .first()
            .and_then(mapper::population)
            .ok_or_else(|| DomainError::ChatUnavailable("serverinfo without client counts".into()))
    }
}

#[async_trait::async_trait]
impl ChatMessenger for TeamSpeakClient {
    async fn send_private(&self, client_id: u64, text: &str) -> Result<(), DomainError> {
        let conn = self.conn().await?;
        conn.records(
            &Command::new("sendtextmessage")
                .arg("targetmode", TARGET_CLIENT)
                .arg("target", client_id)
                .arg("msg", text),
        )
        .await
        .map(|_| ())
    }
}
