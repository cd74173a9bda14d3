//! ForumStore decorator: per-call timeout and exponential backoff on transient failures.

use crate::domain::{DomainError, ForumGroup, ForumGroupId, ForumMember, LinkedAccount, VerifiedAccount};
use crate::ports::ForumStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

fn retry_delay_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    if base_delay_ms == 0 {
        return 0;
    }
    let exponent = attempt.saturating_sub(1).min(10);
    base_delay_ms.saturating_mul(1_u64 << exponent)
}

pub struct RetryingForumStore {
    inner: Arc<dyn ForumStore>,
    max_attempts: u32,
    base_delay_ms: u64,
    call_timeout: Duration,
}

impl RetryingForumStore {
    pub fn new(
        inner: Arc<dyn ForumStore>,
        max_attempts: u32,
        base_delay_ms: u64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            call_timeout,
        }
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, DomainError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(DomainError::StoreUnavailable(format!(
                    "{} timed out after {}ms",
                    op,
                    self.call_timeout.as_millis()
                ))),
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = retry_delay_ms(self.base_delay_ms, attempt);
                    warn!(op, attempt, delay_ms = delay, error = %e, "forum store call failed; retrying");
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait::async_trait]
impl ForumStore for RetryingForumStore {
    async fn list_groups(&self) -> Result<Vec<ForumGroup>, DomainError> {
        self.call("list_groups", || self.inner.list_groups()).await
    }

    async fn list_members_for_groups(
        &self,
        group_ids: &[ForumGroupId],
        include_pending: bool,
    ) -> Result<Vec<ForumMember>, DomainError> {
        self.call("list_members_for_groups", || {
            self.inner.list_members_for_groups(group_ids, include_pending)
        })
        .await
    }

    async fn verify_credential(
        &self,
        username: &str,
        secret_hash: &str,
    ) -> Result<Option<VerifiedAccount>, DomainError> {
        self.call("verify_credential", || {
            self.inner.verify_credential(username, secret_hash)
        })
        .await
    }

    async fn set_linked_identity(&self, account_id: i64, identity: &str) -> Result<(), DomainError> {
        self.call("set_linked_identity", || {
            self.inner.set_linked_identity(account_id, identity)
        })
        .await
    }

    async fn clear_linked_identity(&self, account_id: i64) -> Result<(), DomainError> {
        self.call("clear_linked_identity", || {
            self.inner.clear_linked_identity(account_id)
        })
        .await
    }

    async fn find_conflicting_links(
        &self,
        identity: &str,
        excluding_account_id: i64,
    ) -> Result<Vec<LinkedAccount>, DomainError> {
        self.call("find_conflicting_links", || {
            self.inner.find_conflicting_links(identity, excluding_account_id)
        })
        .await
    }

    async fn find_accounts_by_identity(&self, identity: &str) -> Result<Vec<LinkedAccount>, DomainError> {
        self.call("find_accounts_by_identity", || {
            self.inner.find_accounts_by_identity(identity)
        })
        .await
    }
}
