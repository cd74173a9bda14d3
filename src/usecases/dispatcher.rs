//! Chat command dispatch.
//!
//! Gates, in order: prefix → parse → permission tier → registry lookup → minimum tier.
//! A message stopped at any gate gets no reply. Handlers run in their own task; errors
//! become a terse reply and panics are caught at the join.

use crate::domain::{DomainError, Invoker, PermissionTier};
use crate::ports::{ChatDirectory, ChatMessenger, ForumStore};
use crate::shared::{BotSettings, SharedSettings};
use crate::usecases::command_parser::{parse_args, split_command};
use crate::usecases::commands::{CommandKind, CommandRegistry, LogPolicy};
use crate::usecases::credential_linker::CredentialLinker;
use crate::usecases::group_map::GroupMapStore;
use crate::usecases::reconciler::{Reconciler, SyncMode};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A private text message addressed to the bot.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub invoker: Invoker,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not a command, or unknown command.
    Ignored,
    /// Caller's tier is below the command's minimum.
    Rejected,
    Completed,
    Failed(DomainError),
    Panicked,
}

/// Process start and last connect times for `status`.
#[derive(Debug)]
pub struct RuntimeStatus {
    started_at: DateTime<Utc>,
    connected_at: Mutex<Option<DateTime<Utc>>>,
}

impl RuntimeStatus {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            connected_at: Mutex::new(None),
        }
    }

    fn with_connected<R>(&self, f: impl FnOnce(&mut Option<DateTime<Utc>>) -> R) -> R {
        match self.connected_at.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn mark_connected(&self) {
        self.with_connected(|c| *c = Some(Utc::now()));
    }

    pub fn mark_disconnected(&self) {
        self.with_connected(|c| *c = None);
    }

    pub fn describe(&self, now: DateTime<Utc>) -> String {
        let connected = self.with_connected(|c| *c);
        let connected = match connected {
            Some(at) => format_duration(now - at),
            None => "not connected".to_string(),
        };
        format!(
            "Uptime: {}; Connected: {}",
            format_duration(now - self.started_at),
            connected
        )
    }
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self::new()
    }
}

fn format_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (mins, secs) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else {
        format!("{}m {}s", mins, secs)
    }
}

/// Rebuilds the live settings from configuration for `reload`.
pub type SettingsLoader = Arc<dyn Fn() -> Result<BotSettings, DomainError> + Send + Sync>;

pub struct DispatcherDeps {
    pub messenger: Arc<dyn ChatMessenger>,
    pub chat: Arc<dyn ChatDirectory>,
    pub forum: Arc<dyn ForumStore>,
    pub linker: Arc<CredentialLinker>,
    pub reconciler: Arc<Reconciler>,
    pub group_map: Arc<GroupMapStore>,
    pub settings: SharedSettings,
    pub registry: CommandRegistry,
    pub status: Arc<RuntimeStatus>,
    pub shutdown: Arc<watch::Sender<bool>>,
    pub reload: SettingsLoader,
}

#[derive(Clone)]
pub struct CommandDispatcher {
    deps: Arc<DispatcherDeps>,
}

impl CommandDispatcher {
    pub fn new(deps: DispatcherDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    async fn reply(&self, invoker: &Invoker, text: &str) {
        if let Err(e) = self.deps.messenger.send_private(invoker.client_id, text).await {
            warn!(invoker = %invoker, error = %e, "failed to send reply");
        }
    }

    pub async fn dispatch(&self, msg: IncomingMessage) -> DispatchOutcome {
        let settings = self.deps.settings.current();
        let Some((name, rest)) = split_command(&msg.text, &settings.prefix) else {
            return DispatchOutcome::Ignored;
        };
        let tier = settings
            .tiers
            .resolve(&msg.invoker.unique_id, &msg.invoker.server_groups);
        let Some(spec) = self.deps.registry.get(name) else {
            debug!(invoker = %msg.invoker, command = name, "unknown command");
            return DispatchOutcome::Ignored;
        };
        if spec.min_tier > tier {
            debug!(
                invoker = %msg.invoker,
                command = name,
                tier = tier.label(),
                "insufficient permission"
            );
            return DispatchOutcome::Rejected;
        }

        match spec.log_policy {
            LogPolicy::Full => {
                info!(invoker = %msg.invoker, tier = tier.label(), command = name, args = rest, "command")
            }
            LogPolicy::NameOnly => {
                info!(invoker = %msg.invoker, tier = tier.label(), command = name, "command")
            }
            LogPolicy::Silent => {}
        }

        let kind = spec.kind;
        let args = parse_args(rest);
        let this = self.clone();
        let invoker = msg.invoker.clone();
        let handle =
            tokio::spawn(async move { this.run_handler(kind, &invoker, args, tier).await });

        match handle.await {
            Ok(Ok(())) => DispatchOutcome::Completed,
            Ok(Err(e)) => {
                error!(invoker = %msg.invoker, command = name, error = %e, "command failed");
                self.reply(&msg.invoker, &e.user_message(tier)).await;
                DispatchOutcome::Failed(e)
            }
            Err(join) => {
                error!(invoker = %msg.invoker, command = name, error = %join, "command handler panicked");
                self.reply(&msg.invoker, "An error occurred while processing your request")
                    .await;
                DispatchOutcome::Panicked
            }
        }
    }

    async fn run_handler(
        &self,
        kind: CommandKind,
        invoker: &Invoker,
        args: Vec<String>,
        tier: PermissionTier,
    ) -> Result<(), DomainError> {
        match kind {
            CommandKind::Help => {
                let prefix = self.deps.settings.current().prefix.clone();
                let text = self
                    .deps
                    .registry
                    .render_help(tier, &prefix, args.first().map(String::as_str));
                self.reply(invoker, &text).await;
                Ok(())
            }
            CommandKind::Login => self.login(invoker, &args).await,
            CommandKind::Ping => {
                self.reply(invoker, "Pong!").await;
                Ok(())
            }
            CommandKind::GroupSync => self.group_sync(invoker, &args).await,
            CommandKind::Status => {
                let text = self.deps.status.describe(Utc::now());
                self.reply(invoker, &text).await;
                Ok(())
            }
            CommandKind::Reload => {
                let settings = (self.deps.reload)()?;
                self.deps.settings.replace(settings);
                info!(invoker = %invoker, "configuration reloaded");
                self.reply(invoker, "Configuration reloaded").await;
                Ok(())
            }
            CommandKind::Quit => {
                info!(invoker = %invoker, "shutdown requested");
                self.reply(invoker, "Shutting down").await;
                self.deps.shutdown.send_replace(true);
                Ok(())
            }
        }
    }

    async fn login(&self, invoker: &Invoker, args: &[String]) -> Result<(), DomainError> {
        let [username, secret] = args else {
            return Err(DomainError::Usage(
                "Usage: login \"<username>\" \"<password>\"".into(),
            ));
        };
        let outcome = self
            .deps
            .linker
            .link_identity(&invoker.unique_id, username, secret)
            .await?;
        let mut text = format!(
            "Your TeamSpeak identity is now linked to forum account {}",
            outcome.username
        );
        if !outcome.granted_groups.is_empty() {
            let names: Vec<&str> = outcome
                .granted_groups
                .iter()
                .map(|g| g.name.as_str())
                .collect();
            text.push_str(&format!("\nServer groups added: {}", names.join(", ")));
        }
        self.reply(invoker, &text).await;
        Ok(())
    }

    async fn group_sync(&self, invoker: &Invoker, args: &[String]) -> Result<(), DomainError> {
        let usage = || {
            DomainError::Usage(
                "Usage: groupsync <showmap|showtsgroups|showforumgroups|check|sync|add|rem> [params]"
                    .into(),
            )
        };
        let Some(sub) = args.first() else {
            return Err(usage());
        };
        match sub.as_str() {
            "showmap" => {
                let text = self.render_map().await?;
                self.reply(invoker, &text).await;
            }
            "showtsgroups" => {
                let suffix = self.deps.settings.current().ts_officer_suffix.clone();
                let mut names: Vec<String> = self
                    .deps
                    .chat
                    .list_groups()
                    .await?
                    .into_iter()
                    .filter(|g| g.name.ends_with(&suffix))
                    .map(|g| g.name)
                    .collect();
                names.sort();
                self.reply(invoker, &format!("Server groups: {}", names.join(", ")))
                    .await;
            }
            "showforumgroups" => {
                let mut names: Vec<String> = self
                    .deps
                    .forum
                    .list_groups()
                    .await?
                    .into_iter()
                    .map(|g| g.name)
                    .collect();
                names.sort();
                self.reply(invoker, &format!("Forum groups: {}", names.join(", ")))
                    .await;
            }
            "check" | "sync" => {
                let mode = if sub == "check" {
                    SyncMode::CheckOnly
                } else {
                    SyncMode::Apply
                };
                let report = self.deps.reconciler.run_sync(mode).await?;
                for line in report.chat_lines() {
                    self.reply(invoker, &line).await;
                }
            }
            "add" | "rem" => {
                let [_, chat_name, forum_name] = args else {
                    return Err(DomainError::Usage(format!(
                        "Usage: groupsync {} \"<server group>\" \"<forum group>\"",
                        sub
                    )));
                };
                let chat_group = self.deps.group_map.resolve_chat_group(chat_name).await?;
                let forum_group = self.deps.group_map.resolve_forum_group(forum_name).await?;
                let text = if sub == "add" {
                    self.deps
                        .group_map
                        .add_mapping(&chat_group, &forum_group)
                        .await?;
                    format!("Mapped forum group {} to {}", forum_group.name, chat_group.name)
                } else {
                    self.deps
                        .group_map
                        .remove_mapping(&chat_group, &forum_group)
                        .await?;
                    format!(
                        "Removed forum group {} from {}",
                        forum_group.name, chat_group.name
                    )
                };
                self.reply(invoker, &text).await;
            }
            _ => return Err(usage()),
        }
        Ok(())
    }

    async fn render_map(&self) -> Result<String, DomainError> {
        let mappings = self.deps.group_map.list_mappings().await;
        if mappings.is_empty() {
            return Ok("No group mappings".to_string());
        }
        let names: HashMap<i64, String> = self
            .deps
            .forum
            .list_groups()
            .await?
            .into_iter()
            .map(|g| (g.id, g.name))
            .collect();
        let mut out = String::from("Group map:");
        for (name, mapping) in &mappings {
            let forum: Vec<String> = mapping
                .forum_groups
                .iter()
                .map(|id| names.get(id).cloned().unwrap_or_else(|| format!("#{}", id)))
                .collect();
            out.push_str(&format!(
                "\n{} ({}){}: {}",
                name,
                mapping.sgid,
                if mapping.permanent { " [permanent]" } else { "" },
                forum.join(", ")
            ));
        }
        Ok(out)
    }
}
