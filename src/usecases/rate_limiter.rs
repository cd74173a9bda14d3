//! Failed-login tracking per TeamSpeak identity.
//!
//! Entries are created on the first failure, renewed on every attempt during a lockout
//! and removed when their window has elapsed (lazily on access, or by `sweep`).
//! Attempts still waiting on the credential check hold a reservation, so concurrent
//! attempts for one identity count against the same budget.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub window_start_ms: i64,
    pub failures: u32,
}

impl RateLimitEntry {
    /// A window is open while `start + window > now`.
    fn is_open(&self, now_ms: i64, window_ms: i64) -> bool {
        self.window_start_ms + window_ms > now_ms
    }
}

#[derive(Default)]
struct LimiterState {
    entries: HashMap<String, RateLimitEntry>,
    /// identity → attempts admitted but not yet settled.
    in_flight: HashMap<String, u32>,
}

impl LimiterState {
    fn release(&mut self, identity: &str) {
        if let Some(n) = self.in_flight.get_mut(identity) {
            *n -= 1;
            if *n == 0 {
                self.in_flight.remove(identity);
            }
        }
    }
}

/// Outcome of consulting the limiter before a credential check.
pub enum Admission<'a> {
    Allowed(LoginAttempt<'a>),
    /// Lockout active; the window was renewed.
    Locked,
}

impl Admission<'_> {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

/// Reservation for one admitted attempt. Released on drop; `fail` also records the failure.
pub struct LoginAttempt<'a> {
    limiter: &'a LoginRateLimiter,
    identity: String,
    settled: bool,
}

impl LoginAttempt<'_> {
    /// Settle as a failed verification. Returns the new failure count.
    pub fn fail(mut self, now_ms: i64) -> u32 {
        self.settled = true;
        self.limiter.with_state(|state| {
            state.release(&self.identity);
            LoginRateLimiter::bump(state, &self.identity, now_ms)
        })
    }
}

impl Drop for LoginAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.limiter.with_state(|state| state.release(&self.identity));
        }
    }
}

/// Shared failed-attempt table. Every mutation holds the lock for the whole
/// read-modify-write, so concurrent attempts for one identity never interleave.
pub struct LoginRateLimiter {
    state: Mutex<LimiterState>,
}

impl LoginRateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LimiterState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut LimiterState) -> R) -> R {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn bump(state: &mut LimiterState, identity: &str, now_ms: i64) -> u32 {
        let entry = state
            .entries
            .entry(identity.to_string())
            .or_insert(RateLimitEntry {
                window_start_ms: now_ms,
                failures: 0,
            });
        entry.window_start_ms = now_ms;
        entry.failures += 1;
        entry.failures
    }

    /// Decide whether `identity` may attempt a login at `now_ms`, reserving a slot if so.
    ///
    /// Recorded failures plus unsettled attempts may not exceed `max_failures`.
    pub fn admit(
        &self,
        identity: &str,
        now_ms: i64,
        max_failures: u32,
        window_ms: i64,
    ) -> Admission<'_> {
        let allowed = self.with_state(|state| {
            let failures = match state.entries.get(identity).copied() {
                Some(entry) if entry.is_open(now_ms, window_ms) => {
                    if entry.failures >= max_failures {
                        if let Some(e) = state.entries.get_mut(identity) {
                            e.window_start_ms = now_ms;
                        }
                        return false;
                    }
                    entry.failures
                }
                Some(_) => {
                    state.entries.remove(identity);
                    0
                }
                None => 0,
            };
            let pending = state.in_flight.get(identity).copied().unwrap_or(0);
            if failures + pending >= max_failures {
                return false;
            }
            *state.in_flight.entry(identity.to_string()).or_insert(0) += 1;
            true
        });
        if allowed {
            Admission::Allowed(LoginAttempt {
                limiter: self,
                identity: identity.to_string(),
                settled: false,
            })
        } else {
            Admission::Locked
        }
    }

    /// Record a failed verification outside an admitted attempt. Returns the new failure count.
    pub fn record_failure(&self, identity: &str, now_ms: i64) -> u32 {
        self.with_state(|state| Self::bump(state, identity, now_ms))
    }

    /// Drop every entry whose window has elapsed. Returns how many were evicted.
    pub fn sweep(&self, now_ms: i64, window_ms: i64) -> usize {
        self.with_state(|state| {
            let before = state.entries.len();
            state.entries.retain(|_, e| e.is_open(now_ms, window_ms));
            before - state.entries.len()
        })
    }

    pub fn entry(&self, identity: &str) -> Option<RateLimitEntry> {
        self.with_state(|state| state.entries.get(identity).copied())
    }

    /// Attempts admitted for `identity` that have not settled yet.
    pub fn in_flight(&self, identity: &str) -> u32 {
        self.with_state(|state| state.in_flight.get(identity).copied().unwrap_or(0))
    }

    pub fn len(&self) -> usize {
        self.with_state(|state| state.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LoginRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
