//! Command registry: name → minimum tier, usage, help text, handler tag, log policy.

use crate::domain::{DomainError, PermissionTier};
use std::collections::{BTreeMap, HashSet};

/// Handler tag. Each one is registered under exactly one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Help,
    Login,
    Ping,
    GroupSync,
    Status,
    Reload,
    Quit,
}

impl CommandKind {
    pub const ALL: [CommandKind; 7] = [
        CommandKind::Help,
        CommandKind::Login,
        CommandKind::Ping,
        CommandKind::GroupSync,
        CommandKind::Status,
        CommandKind::Reload,
        CommandKind::Quit,
    ];
}

/// What the dispatcher writes to the log for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPolicy {
    Full,
    /// Arguments may carry secrets.
    NameOnly,
    Silent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub min_tier: PermissionTier,
    pub args: &'static str,
    pub short_help: &'static str,
    pub long_help: &'static [&'static str],
    pub kind: CommandKind,
    pub log_policy: LogPolicy,
}

impl CommandSpec {
    pub fn usage(&self) -> String {
        if self.args.is_empty() {
            self.name.to_string()
        } else {
            format!("{} {}", self.name, self.args)
        }
    }
}

const QUOTE_NOTE: &str = "Parameters with spaces must be enclosed in quotes. \
                          Quotes inside a parameter are escaped with a backslash (\\\").";

fn standard_specs() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "help",
            min_tier: PermissionTier::None,
            args: "[command]",
            short_help: "Show available commands or detailed help for one",
            long_help: &[],
            kind: CommandKind::Help,
            log_policy: LogPolicy::Silent,
        },
        CommandSpec {
            name: "login",
            min_tier: PermissionTier::None,
            args: "\"<username>\" \"<password>\"",
            short_help: "Link your forum account to this TeamSpeak identity",
            long_help: &[
                "Verifies your forum username and password and stores your TeamSpeak \
                 identity on your forum profile.",
                "Your forum groups are applied to your TeamSpeak client immediately.",
                "Example: login \"john doe\" \"my password\"",
            ],
            kind: CommandKind::Login,
            log_policy: LogPolicy::NameOnly,
        },
        CommandSpec {
            name: "ping",
            min_tier: PermissionTier::Guest,
            args: "",
            short_help: "Check that the bot is responding",
            long_help: &[],
            kind: CommandKind::Ping,
            log_policy: LogPolicy::Silent,
        },
        CommandSpec {
            name: "groupsync",
            min_tier: PermissionTier::Mod,
            args: "<showmap|showtsgroups|showforumgroups|check|sync|add|rem> [params]",
            short_help: "Manage and run forum → TeamSpeak group sync",
            long_help: &[
                "showmap: list mapped server groups and their forum groups",
                "showtsgroups: list server groups that may be mapped",
                "showforumgroups: list forum groups",
                "check: show what a sync would change without changing anything",
                "sync: run a full sync now",
                "add \"<server group>\" \"<forum group>\": map a forum group onto a server group",
                "rem \"<server group>\" \"<forum group>\": remove a forum group from a mapping",
            ],
            kind: CommandKind::GroupSync,
            log_policy: LogPolicy::Full,
        },
        CommandSpec {
            name: "status",
            min_tier: PermissionTier::Admin,
            args: "",
            short_help: "Show uptime and connection time",
            long_help: &[],
            kind: CommandKind::Status,
            log_policy: LogPolicy::Full,
        },
        CommandSpec {
            name: "reload",
            min_tier: PermissionTier::Owner,
            args: "",
            short_help: "Reload configuration",
            long_help: &[],
            kind: CommandKind::Reload,
            log_policy: LogPolicy::Full,
        },
        CommandSpec {
            name: "quit",
            min_tier: PermissionTier::Owner,
            args: "",
            short_help: "Shut the bot down",
            long_help: &[],
            kind: CommandKind::Quit,
            log_policy: LogPolicy::Full,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, CommandSpec>,
}

impl CommandRegistry {
    /// Validates that names are unique and every handler is registered exactly once.
    pub fn new(specs: Vec<CommandSpec>) -> Result<Self, DomainError> {
        let mut commands = BTreeMap::new();
        let mut kinds = HashSet::new();
        for spec in specs {
            if !kinds.insert(spec.kind) {
                return Err(DomainError::Config(format!(
                    "handler {:?} registered twice",
                    spec.kind
                )));
            }
            let name = spec.name;
            if commands.insert(name, spec).is_some() {
                return Err(DomainError::Config(format!(
                    "command {} registered twice",
                    name
                )));
            }
        }
        if let Some(missing) = CommandKind::ALL.iter().find(|k| !kinds.contains(k)) {
            return Err(DomainError::Config(format!(
                "handler {:?} has no command",
                missing
            )));
        }
        Ok(Self { commands })
    }

    pub fn standard() -> Result<Self, DomainError> {
        Self::new(standard_specs())
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    /// Commands the tier may run, by name.
    pub fn available(&self, tier: PermissionTier) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values().filter(move |c| c.min_tier <= tier)
    }

    /// Help text. Without a topic: the command list, or detailed help when the caller
    /// only has tier `None`.
    pub fn render_help(&self, tier: PermissionTier, prefix: &str, topic: Option<&str>) -> String {
        let topic_spec = topic
            .and_then(|name| self.get(name))
            .filter(|c| c.min_tier <= tier);
        if let Some(spec) = topic_spec {
            return self.detailed(&[spec], prefix);
        }
        let available: Vec<&CommandSpec> = self.available(tier).collect();
        if tier == PermissionTier::None {
            return self.detailed(&available, prefix);
        }
        let mut out = String::from("Available commands:");
        for spec in available {
            out.push_str(&format!("\n{}{}: {}", prefix, spec.usage(), spec.short_help));
        }
        out.push_str(&format!(
            "\nUse {}help <command> for details. {}",
            prefix, QUOTE_NOTE
        ));
        out
    }

    fn detailed(&self, specs: &[&CommandSpec], prefix: &str) -> String {
        let mut out = String::new();
        for spec in specs {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("{}{}\n  {}", prefix, spec.usage(), spec.short_help));
            for line in spec.long_help {
                out.push_str(&format!("\n  {}", line));
            }
        }
        out.push('\n');
        out.push_str(QUOTE_NOTE);
        out
    }
}
