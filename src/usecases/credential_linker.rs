//! `login`: verify forum credentials and bind the forum account to the caller's identity.
//!
//! Rate limited per identity. On success the caller's mapped server groups are granted
//! right away instead of waiting for the next sync cycle.

use crate::domain::{ChatGroup, DomainError};
use crate::ports::ForumStore;
use crate::shared::SharedSettings;
use crate::usecases::rate_limiter::{Admission, LoginRateLimiter};
use crate::usecases::reconciler::Reconciler;
use chrono::Utc;
use md5::{Digest, Md5};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOutcome {
    pub account_id: i64,
    pub username: String,
    /// Forum account whose stale link to this identity was cleared.
    pub replaced_link: Option<i64>,
    pub granted_groups: Vec<ChatGroup>,
}

pub struct CredentialLinker {
    forum: Arc<dyn ForumStore>,
    reconciler: Arc<Reconciler>,
    limiter: Arc<LoginRateLimiter>,
    settings: SharedSettings,
}

impl CredentialLinker {
    pub fn new(
        forum: Arc<dyn ForumStore>,
        reconciler: Arc<Reconciler>,
        limiter: Arc<LoginRateLimiter>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            forum,
            reconciler,
            limiter,
            settings,
        }
    }

    pub async fn link_identity(
        &self,
        caller_identity: &str,
        username: &str,
        secret: &str,
    ) -> Result<LinkOutcome, DomainError> {
        self.link_identity_at(caller_identity, username, secret, Utc::now().timestamp_millis())
            .await
    }

    /// Same as `link_identity` with an explicit clock (epoch ms).
    pub async fn link_identity_at(
        &self,
        caller_identity: &str,
        username: &str,
        secret: &str,
        now_ms: i64,
    ) -> Result<LinkOutcome, DomainError> {
        if username.is_empty() || secret.is_empty() {
            return Err(DomainError::Usage(
                "Usage: login \"<username>\" \"<password>\"".into(),
            ));
        }

        let settings = self.settings.current();
        // The reservation is released on every exit, including store errors.
        let attempt = match self.limiter.admit(
            caller_identity,
            now_ms,
            settings.max_login_attempts,
            settings.login_error_timeout_ms,
        ) {
            Admission::Allowed(attempt) => attempt,
            Admission::Locked => {
                warn!(identity = caller_identity, "login rejected: too many failed attempts");
                return Err(DomainError::RateLimited {
                    minutes: settings.login_cooldown_minutes(),
                });
            }
        };

        let secret_hash = format!("{:x}", Md5::digest(secret.as_bytes()));
        let verified = self.forum.verify_credential(username, &secret_hash).await?;
        let account = match verified {
            Some(account) if account.valid => {
                drop(attempt);
                account
            }
            _ => {
                let failures = attempt.fail(now_ms);
                warn!(
                    identity = caller_identity,
                    user = username,
                    failures,
                    "failed login"
                );
                return Err(DomainError::InvalidCredentials);
            }
        };

        let conflicts = self
            .forum
            .find_conflicting_links(caller_identity, account.account_id)
            .await?;
        let replaced_link = match conflicts.as_slice() {
            [] => None,
            [previous] => {
                info!(
                    identity = caller_identity,
                    previous_account = previous.account_id,
                    previous_user = %previous.username,
                    "clearing previous identity link"
                );
                self.forum.clear_linked_identity(previous.account_id).await?;
                Some(previous.account_id)
            }
            many => {
                warn!(
                    identity = caller_identity,
                    accounts = ?many.iter().map(|a| a.account_id).collect::<Vec<_>>(),
                    "identity linked to several forum accounts"
                );
                return Err(DomainError::AmbiguousAccount {
                    identity: caller_identity.to_string(),
                    count: many.len(),
                });
            }
        };

        self.forum
            .set_linked_identity(account.account_id, caller_identity)
            .await?;
        info!(
            identity = caller_identity,
            account_id = account.account_id,
            user = %account.username,
            "identity linked"
        );

        let granted_groups = match self.reconciler.apply_mappings_for(caller_identity).await {
            Ok(groups) => groups,
            Err(e) => {
                warn!(identity = caller_identity, error = %e, "failed to apply group mappings after login");
                Vec::new()
            }
        };

        Ok(LinkOutcome {
            account_id: account.account_id,
            username: account.username,
            replaced_link,
            granted_groups,
        })
    }
}
