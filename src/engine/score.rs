use chrono::Duration;
use regex::RegexSet;

use crate::config::RiskConfig;
use crate::engine::ledger::LedgerSnapshot;

/// Billing plan of the account behind an identity. Governs which upload
/// checks apply: free plans are capped by the daily quota alone, premium
/// plans additionally get the short burst check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountPlan {
    #[default]
    Free,
    Premium,
}

/// Facts about the identity that do not live in the activity ledger: the
/// caller supplies them per request. The daily upload count comes from the
/// platform's quota store because the ledger only retains one hour of
/// events.
#[derive(Debug, Clone, Default)]
pub struct StaticSignals {
    pub plan: AccountPlan,
    /// Age of the account, when the platform knows it.
    pub account_age: Option<Duration>,
    /// Uploads recorded today by the quota collaborator.
    pub uploads_today: u32,
    pub user_agent: Option<String>,
}

/// Compiled user-agent classification rules. Built once at engine
/// construction; the patterns catch the common scripting and scanner
/// clients that never belong on the vault's interactive routes.
pub struct UaRules {
    suspicious_set: RegexSet,
}

impl UaRules {
    pub fn new() -> Self {
        let suspicious_patterns = vec![
            r"(?i)(bot|crawler|spider|scraper)",
            r"(?i)(curl|wget|python-requests|python-urllib|go-http-client|java/|okhttp)",
            r"(?i)(headless|phantomjs|selenium|puppeteer)",
            r"(?i)(sqlmap|nikto|nmap|masscan|dirbuster|nuclei)",
        ];

        Self {
            suspicious_set: RegexSet::new(&suspicious_patterns).unwrap(),
        }
    }

    /// True when the agent string matches a known automation pattern.
    pub fn is_suspicious(&self, user_agent: &str) -> bool {
        self.suspicious_set.is_match(user_agent)
    }
}

impl Default for UaRules {
    fn default() -> Self {
        Self::new()
    }
}

fn plan_daily_quota(plan: AccountPlan, config: &RiskConfig) -> u32 {
    match plan {
        AccountPlan::Free => config.daily_quota_free,
        AccountPlan::Premium => config.daily_quota_premium,
    }
}

/// Computes the composite abuse score for one identity.
///
/// Pure given its inputs: the ledger snapshot, the caller-supplied static
/// signals, and the local hour all arrive as arguments, so every signal and
/// every combination can be unit-tested in isolation. Sub-scores are summed
/// and clamped to [0, 100]; each triggered signal contributes one
/// human-readable reason for the audit trail.
pub fn score(
    snapshot: &LedgerSnapshot,
    signals: &StaticSignals,
    local_hour: u32,
    config: &RiskConfig,
    ua_rules: &UaRules,
) -> (u8, Vec<String>) {
    let weights = &config.weights;
    let mut total: u32 = 0;
    let mut reasons = Vec::new();

    // Upload burst only applies to premium plans; free plans are governed
    // by the daily quota below.
    if signals.plan == AccountPlan::Premium && snapshot.recent_uploads > config.upload_burst_limit {
        total += weights.upload_burst;
        reasons.push(format!(
            "upload burst: {} uploads in the last {}s (limit {})",
            snapshot.recent_uploads, config.upload_burst_window_secs, config.upload_burst_limit
        ));
    }

    let quota = plan_daily_quota(signals.plan, config);
    if signals.uploads_today > quota {
        total += weights.daily_quota;
        reasons.push(format!(
            "daily upload quota exceeded: {} uploads today (limit {})",
            signals.uploads_today, quota
        ));
    }

    if snapshot.login_failures > config.login_failure_limit {
        total += weights.failed_logins;
        reasons.push(format!(
            "{} failed logins in the last {}s (limit {})",
            snapshot.login_failures, config.login_window_secs, config.login_failure_limit
        ));
    }

    if snapshot.distinct_failure_sources >= config.distinct_address_limit {
        total += weights.multi_address;
        reasons.push(format!(
            "login failures from {} distinct addresses",
            snapshot.distinct_failure_sources
        ));
    }

    if snapshot.profile_edits > config.profile_edit_limit {
        total += weights.profile_edits;
        reasons.push(format!(
            "{} profile edits in the last {}s (limit {})",
            snapshot.profile_edits, config.profile_window_secs, config.profile_edit_limit
        ));
    }

    if snapshot.api_requests > config.api_request_limit {
        total += weights.api_abuse;
        reasons.push(format!(
            "{} API requests in the last {}s (limit {})",
            snapshot.api_requests, config.api_window_secs, config.api_request_limit
        ));
    }

    let regular_interval = snapshot.interval_samples >= config.interval_min_samples
        && snapshot.interval_variance_ms2 < config.interval_variance_ms2
        && snapshot.interval_mean_ms < config.interval_mean_ms;
    let endpoint_hammering = snapshot.max_endpoint_hits > config.endpoint_repeat_limit;
    if regular_interval || endpoint_hammering {
        total += weights.interval_pattern;
        if regular_interval {
            reasons.push(format!(
                "machine-regular request pattern: mean gap {:.0}ms, variance {:.0}ms²",
                snapshot.interval_mean_ms, snapshot.interval_variance_ms2
            ));
        } else {
            reasons.push(format!(
                "{} requests to a single endpoint in the last {}s",
                snapshot.max_endpoint_hits, config.api_window_secs
            ));
        }
    }

    if let Some(age) = signals.account_age {
        if age < config.new_account_age() {
            total += weights.new_account;
            reasons.push(format!(
                "account younger than {}h",
                config.new_account_age_hours
            ));
        }
    }

    match signals.user_agent.as_deref() {
        Some(agent) => {
            if ua_rules.is_suspicious(agent) {
                total += weights.suspicious_agent;
                reasons.push(format!("suspicious user agent: {}", agent));
            }
        }
        None => {
            total += weights.suspicious_agent;
            reasons.push("missing user agent".to_string());
        }
    }

    if local_hour >= config.off_hours_start && local_hour < config.off_hours_end {
        total += weights.off_hours;
        reasons.push(format!("activity at off-hours (local hour {})", local_hour));
    }

    (total.min(100) as u8, reasons)
}
