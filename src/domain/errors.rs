//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors into these.

use crate::domain::permission::PermissionTier;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Forum store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("TeamSpeak unavailable: {0}")]
    ChatUnavailable(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Too many failed logins; `minutes` is the cooldown shown to the user.
    #[error("Too many failed login attempts (cooldown {minutes} minutes)")]
    RateLimited { minutes: u64 },

    #[error("{count} forum accounts are linked to identity {identity}")]
    AmbiguousAccount { identity: String, count: usize },

    #[error("{0}")]
    Usage(String),

    #[error("Not eligible for mapping: {0}")]
    NotEligible(String),

    #[error("{0} can not be edited")]
    Immutable(String),

    #[error("Map does not exist")]
    MapNotFound,

    #[error("Map already exists")]
    AlreadyMapped,

    #[error("{0} group not found")]
    GroupNotFound(String),

    #[error("A group sync is already running")]
    SyncAlreadyRunning,

    #[error("Group map persistence error: {0}")]
    Persistence(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DomainError {
    /// Terse reply for the chat user. Internal detail only for privileged tiers.
    pub fn user_message(&self, tier: PermissionTier) -> String {
        match self {
            Self::InvalidCredentials
            | Self::Usage(_)
            | Self::NotEligible(_)
            | Self::Immutable(_)
            | Self::MapNotFound
            | Self::AlreadyMapped
            | Self::GroupNotFound(_)
            | Self::SyncAlreadyRunning => self.to_string(),
            Self::RateLimited { minutes } => format!(
                "You have too many failed login attempts. Please wait {} minutes and try again.",
                minutes
            ),
            Self::AmbiguousAccount { .. } => "There is a conflict with your TeamSpeak identity. \
                 Please verify your forum profile and contact the leadership for help."
                .to_string(),
            _ if tier.is_privileged() => {
                format!("An error occurred while processing your request\n{}", self)
            }
            _ => "An error occurred while processing your request".to_string(),
        }
    }

    /// Transient failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::ChatUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_detail_only_for_privileged_callers() {
        let err = DomainError::StoreUnavailable("connection refused".into());
        assert!(!err.user_message(PermissionTier::Member).contains("refused"));
        assert!(err.user_message(PermissionTier::Mod).contains("refused"));
    }

    #[test]
    fn ambiguous_account_never_leaks_identity() {
        let err = DomainError::AmbiguousAccount {
            identity: "abc=".into(),
            count: 2,
        };
        assert!(!err.user_message(PermissionTier::Owner).contains("abc="));
    }

    #[test]
    fn rate_limited_mentions_cooldown() {
        let err = DomainError::RateLimited { minutes: 5 };
        assert!(err.user_message(PermissionTier::None).contains("5 minutes"));
    }
}
