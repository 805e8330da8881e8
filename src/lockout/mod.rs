use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RiskConfig;
use crate::escalation::{Dispatcher, Escalation};

/// Failure history for one (address, email) pair. Only timestamps inside
/// the active window count toward the block decision; older ones are pruned
/// lazily on access. The notice flags re-arm when the qualifying count
/// falls back below their mark, so each window produces at most one
/// preventive notice and one lockout notice.
#[derive(Debug, Default)]
struct LockoutEntry {
    failures: VecDeque<DateTime<Utc>>,
    warned: bool,
    block_notified: bool,
}

impl LockoutEntry {
    fn prune(&mut self, cutoff: DateTime<Utc>, warn_at: u32, limit: u32) {
        while self.failures.front().is_some_and(|t| *t < cutoff) {
            self.failures.pop_front();
        }
        let count = self.failures.len() as u32;
        if count < warn_at {
            self.warned = false;
        }
        if count < limit {
            self.block_notified = false;
        }
    }
}

/// Sliding-window brute-force gate for the authentication endpoint, keyed
/// by (network address, claimed email). Intentionally independent of the
/// risk policy machine: it produces a hard reject before any scoring runs.
pub struct LockoutTracker {
    entries: DashMap<(String, String), LockoutEntry>,
    window: Duration,
    limit: u32,
    warn_at: u32,
    idle_grace: Duration,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
}

impl LockoutTracker {
    pub fn new(config: &RiskConfig, clock: Arc<dyn Clock>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            entries: DashMap::new(),
            window: config.lockout_window(),
            limit: config.lockout_limit,
            warn_at: config.lockout_warn_at,
            idle_grace: config.lockout_idle_grace(),
            clock,
            dispatcher,
        }
    }

    /// Records one failed credential check. Dispatches the preventive
    /// notice when the warn mark is first reached within the window, and
    /// the lockout notice when the limit is first crossed.
    pub fn record_failure(&self, address: &str, email: &str) {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry((address.to_string(), email.to_string()))
            .or_default();
        entry.prune(now - self.window, self.warn_at, self.limit);
        entry.failures.push_back(now);

        let count = entry.failures.len() as u32;
        if count >= self.warn_at && !entry.warned {
            entry.warned = true;
            debug!(
                "Login failures mounting for {} from {}: {} in window",
                email, address, count
            );
            self.dispatcher.dispatch(Escalation::LoginFlood {
                address: address.to_string(),
                email: email.to_string(),
                failures: count,
            });
        }
        if count >= self.limit && !entry.block_notified {
            entry.block_notified = true;
            warn!(
                "Lockout engaged for {} from {}: {} failures in window",
                email, address, count
            );
            self.dispatcher.dispatch(Escalation::Lockout {
                address: address.to_string(),
                email: email.to_string(),
                failures: count,
            });
        }
    }

    /// Whether the pair is currently locked out, and for how much longer.
    /// The block lifts on its own once enough old failures age out of the
    /// window to bring the count back under the limit.
    pub fn is_blocked(&self, address: &str, email: &str) -> (bool, Duration) {
        let now = self.clock.now();
        let Some(mut entry) = self
            .entries
            .get_mut(&(address.to_string(), email.to_string()))
        else {
            return (false, Duration::zero());
        };
        entry.prune(now - self.window, self.warn_at, self.limit);

        let count = entry.failures.len();
        if count < self.limit as usize {
            return (false, Duration::zero());
        }

        // The block lasts until the count drops below the limit, i.e. until
        // the failure at index count-limit ages out of the window.
        let pivot = entry.failures[count - self.limit as usize];
        let remaining = (pivot + self.window - now).max(Duration::zero());
        (true, remaining)
    }

    /// Evicts pairs whose newest failure is older than window + grace.
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now() - self.window - self.idle_grace;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.failures.back().is_some_and(|t| *t >= cutoff));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Lockout sweep evicted {} stale entries", removed);
        }
        removed
    }

    /// Number of (address, email) pairs currently tracked.
    pub fn tracked_pairs(&self) -> usize {
        self.entries.len()
    }
}
