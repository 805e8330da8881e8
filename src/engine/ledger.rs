use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::config::RiskConfig;

/// Metadata key carrying the source network address of a failed login.
pub const META_ADDRESS: &str = "address";
/// Metadata key carrying the endpoint path of an API request.
pub const META_ENDPOINT: &str = "endpoint";

/// The kinds of per-identity activity the ledger tracks, each in its own
/// time-ordered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    Request,
    Upload,
    LoginFailure,
    ProfileChange,
}

/// A single observed event. Immutable once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub category: ActivityCategory,
    pub metadata: HashMap<String, String>,
}

/// Per-identity event store: one append-only sequence per category, trimmed
/// to the retention horizon lazily on query and by the periodic sweep.
#[derive(Debug, Default)]
struct ActivityWindow {
    requests: VecDeque<ActivityEvent>,
    uploads: VecDeque<ActivityEvent>,
    failed_logins: VecDeque<ActivityEvent>,
    profile_changes: VecDeque<ActivityEvent>,
    last_activity: Option<DateTime<Utc>>,
}

impl ActivityWindow {
    fn sequence(&self, category: ActivityCategory) -> &VecDeque<ActivityEvent> {
        match category {
            ActivityCategory::Request => &self.requests,
            ActivityCategory::Upload => &self.uploads,
            ActivityCategory::LoginFailure => &self.failed_logins,
            ActivityCategory::ProfileChange => &self.profile_changes,
        }
    }

    fn sequence_mut(&mut self, category: ActivityCategory) -> &mut VecDeque<ActivityEvent> {
        match category {
            ActivityCategory::Request => &mut self.requests,
            ActivityCategory::Upload => &mut self.uploads,
            ActivityCategory::LoginFailure => &mut self.failed_logins,
            ActivityCategory::ProfileChange => &mut self.profile_changes,
        }
    }

    /// Drops entries older than `horizon` from every sequence. Entries at or
    /// newer than the horizon are never removed.
    fn prune(&mut self, now: DateTime<Utc>, horizon: Duration) {
        let cutoff = now - horizon;
        for category in [
            ActivityCategory::Request,
            ActivityCategory::Upload,
            ActivityCategory::LoginFailure,
            ActivityCategory::ProfileChange,
        ] {
            let seq = self.sequence_mut(category);
            while seq.front().is_some_and(|e| e.timestamp < cutoff) {
                seq.pop_front();
            }
        }
    }
}

/// Everything the scorer needs to know about one identity's recent activity,
/// captured under a single entry guard so the numbers are mutually consistent.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    /// Uploads inside the burst window.
    pub recent_uploads: u32,
    /// Failed logins inside the login window.
    pub login_failures: u32,
    /// Distinct source addresses among those failures.
    pub distinct_failure_sources: u32,
    /// Profile edits inside the profile window.
    pub profile_edits: u32,
    /// Requests inside the API window.
    pub api_requests: u32,
    /// Number of inter-arrival gaps between those requests.
    pub interval_samples: u32,
    /// Mean inter-arrival gap in milliseconds.
    pub interval_mean_ms: f64,
    /// Population variance of the inter-arrival gaps in ms².
    pub interval_variance_ms2: f64,
    /// Highest request count against any single endpoint in the API window.
    pub max_endpoint_hits: u32,
}

/// Time-windowed event store for every observed identity. State is held in a
/// sharded concurrent map; all mutation of one identity's window happens
/// under that entry's shard guard.
pub struct ActivityLedger {
    windows: DashMap<String, ActivityWindow>,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl ActivityLedger {
    pub fn new(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            retention,
            clock,
        }
    }

    /// Appends an event stamped with the current clock time under the
    /// identity's entry guard.
    pub fn record(&self, key: &str, category: ActivityCategory, metadata: HashMap<String, String>) {
        let now = self.clock.now();
        let mut window = self.windows.entry(key.to_string()).or_default();
        window.sequence_mut(category).push_back(ActivityEvent {
            timestamp: now,
            category,
            metadata,
        });
        window.last_activity = Some(now);
    }

    /// Returns the events of `category` newer than `now - duration`, pruning
    /// entries past the retention horizon as a side effect so later scans
    /// stay bounded.
    pub fn window(
        &self,
        key: &str,
        category: ActivityCategory,
        duration: Duration,
    ) -> (usize, Vec<ActivityEvent>) {
        let now = self.clock.now();
        let Some(mut window) = self.windows.get_mut(key) else {
            return (0, Vec::new());
        };
        window.prune(now, self.retention);

        let cutoff = now - duration;
        let events: Vec<ActivityEvent> = window
            .sequence(category)
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect();
        (events.len(), events)
    }

    /// Computes every windowed statistic the scorer consumes, under one
    /// entry guard, so the snapshot reflects a single consistent view of the
    /// identity's ledger.
    pub fn snapshot(&self, key: &str, config: &RiskConfig) -> LedgerSnapshot {
        let now = self.clock.now();
        let Some(mut window) = self.windows.get_mut(key) else {
            return LedgerSnapshot::default();
        };
        window.prune(now, self.retention);

        let mut snapshot = LedgerSnapshot::default();

        let upload_cutoff = now - config.upload_burst_window();
        snapshot.recent_uploads = window
            .uploads
            .iter()
            .filter(|e| e.timestamp >= upload_cutoff)
            .count() as u32;

        let login_cutoff = now - config.login_window();
        let mut sources = HashSet::new();
        for event in window
            .failed_logins
            .iter()
            .filter(|e| e.timestamp >= login_cutoff)
        {
            snapshot.login_failures += 1;
            if let Some(addr) = event.metadata.get(META_ADDRESS) {
                sources.insert(addr.clone());
            }
        }
        snapshot.distinct_failure_sources = sources.len() as u32;

        let profile_cutoff = now - config.profile_window();
        snapshot.profile_edits = window
            .profile_changes
            .iter()
            .filter(|e| e.timestamp >= profile_cutoff)
            .count() as u32;

        let api_cutoff = now - config.api_window();
        let recent_requests: Vec<&ActivityEvent> = window
            .requests
            .iter()
            .filter(|e| e.timestamp >= api_cutoff)
            .collect();
        snapshot.api_requests = recent_requests.len() as u32;

        let mut endpoint_hits: HashMap<&str, u32> = HashMap::new();
        for event in &recent_requests {
            if let Some(endpoint) = event.metadata.get(META_ENDPOINT) {
                *endpoint_hits.entry(endpoint.as_str()).or_default() += 1;
            }
        }
        snapshot.max_endpoint_hits = endpoint_hits.values().copied().max().unwrap_or(0);

        // Inter-arrival gaps between consecutive requests, in milliseconds.
        let gaps: Vec<f64> = recent_requests
            .windows(2)
            .map(|pair| (pair[1].timestamp - pair[0].timestamp).num_milliseconds() as f64)
            .collect();
        snapshot.interval_samples = gaps.len() as u32;
        if !gaps.is_empty() {
            let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
            let variance =
                gaps.iter().map(|g| (g - mean) * (g - mean)).sum::<f64>() / gaps.len() as f64;
            snapshot.interval_mean_ms = mean;
            snapshot.interval_variance_ms2 = variance;
        }

        snapshot
    }

    /// Timestamp of the identity's most recent event, if it is still tracked.
    pub fn last_activity(&self, key: &str) -> Option<DateTime<Utc>> {
        self.windows.get(key).and_then(|w| w.last_activity)
    }

    /// Evicts identities idle longer than `idle_horizon`. DashMap's `retain`
    /// walks the table shard by shard, so no two shard locks are ever held
    /// at once. Returns the number of evicted identities.
    pub fn sweep(&self, idle_horizon: Duration) -> usize {
        let cutoff = self.clock.now() - idle_horizon;
        let before = self.windows.len();
        self.windows
            .retain(|_, window| window.last_activity.is_some_and(|t| t >= cutoff));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!("Activity sweep evicted {} idle identities", removed);
        }
        removed
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }
}
