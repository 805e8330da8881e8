use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when the engine is handed a configuration it cannot safely run
/// with. Construction fails fast rather than limping along with thresholds
/// that would make the policy machine undecidable.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("warning threshold must be in 1..=100, got {0}")]
    WarningThresholdOutOfRange(u8),
    #[error("critical threshold must be in 1..=100, got {0}")]
    CriticalThresholdOutOfRange(u8),
    #[error("warning threshold ({warning}) must be below critical threshold ({critical})")]
    ThresholdOrder { warning: u8, critical: u8 },
    #[error("{name} must be nonzero")]
    ZeroDuration { name: &'static str },
    #[error("{name} must be nonzero")]
    ZeroLimit { name: &'static str },
    #[error("off-hours range [{start}, {end}) is not a valid hour range")]
    OffHoursRange { start: u32, end: u32 },
    #[error("lockout warn-at ({warn_at}) must not exceed the lockout limit ({limit})")]
    LockoutOrder { warn_at: u32, limit: u32 },
}

/// Per-signal score contributions. Each weight is the number of points a
/// triggered signal adds to the composite score before clamping to [0, 100].
/// Zeroing a weight disables the signal.
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
#[serde(default)]
pub struct SignalWeights {
    pub upload_burst: u32,
    pub daily_quota: u32,
    pub failed_logins: u32,
    pub multi_address: u32,
    pub profile_edits: u32,
    pub api_abuse: u32,
    pub interval_pattern: u32,
    pub new_account: u32,
    pub suspicious_agent: u32,
    pub off_hours: u32,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            upload_burst: 30,
            daily_quota: 30,
            failed_logins: 25,
            multi_address: 10,
            profile_edits: 20,
            api_abuse: 35,
            interval_pattern: 10,
            new_account: 5,
            suspicious_agent: 15,
            off_hours: 5,
        }
    }
}

/// The full configuration surface of the engine: every window, limit,
/// threshold, and weight the scorer, policy machine, lockout tracker, and
/// sweeper consult. Durations are plain seconds so the config file stays
/// readable.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RiskConfig {
    /// Number of tokio worker threads for the service binary.
    pub workers: usize,
    /// Bind address for the admin/metrics server.
    pub admin_bind: String,

    // ── Scoring windows and trigger limits ──────────────────────────────────
    /// Window for the premium upload-burst check.
    pub upload_burst_window_secs: u64,
    /// Uploads above this count within the burst window trigger the signal.
    pub upload_burst_limit: u32,
    /// Daily upload allowance for free accounts.
    pub daily_quota_free: u32,
    /// Daily upload allowance for premium accounts.
    pub daily_quota_premium: u32,
    /// Window for counting failed logins per identity.
    pub login_window_secs: u64,
    /// Failures above this count within the login window trigger the signal.
    pub login_failure_limit: u32,
    /// Distinct source addresses at or above this count trigger the signal.
    pub distinct_address_limit: u32,
    /// Window for counting profile edits.
    pub profile_window_secs: u64,
    /// Edits above this count within the profile window trigger the signal.
    pub profile_edit_limit: u32,
    /// Window for the API request-rate and interval-pattern checks.
    pub api_window_secs: u64,
    /// Requests above this count within the API window trigger the signal.
    pub api_request_limit: u32,
    /// Minimum inter-arrival samples before the interval pattern is evaluated.
    pub interval_min_samples: u32,
    /// Inter-arrival variance below this (ms²) counts as machine-regular.
    pub interval_variance_ms2: f64,
    /// Inter-arrival mean below this (ms) counts as machine-fast.
    pub interval_mean_ms: f64,
    /// Requests to a single endpoint above this count trigger the pattern signal.
    pub endpoint_repeat_limit: u32,
    /// Accounts younger than this are flagged by the new-account signal.
    pub new_account_age_hours: u32,
    /// Start of the off-hours range (local hour, inclusive).
    pub off_hours_start: u32,
    /// End of the off-hours range (local hour, exclusive).
    pub off_hours_end: u32,

    // ── Policy thresholds ───────────────────────────────────────────────────
    /// Scores at or above this mark the identity as warned.
    pub warning_threshold: u8,
    /// Scores at or above this block the identity.
    pub critical_threshold: u8,
    /// How long a block lasts before the lazy auto-unblock clears it.
    pub block_duration_secs: u64,

    // ── Ledger retention and sweeping ───────────────────────────────────────
    /// Events older than this are pruned from every category sequence.
    pub retention_horizon_secs: u64,
    /// Identities idle longer than this are evicted by the sweep.
    pub activity_idle_horizon_secs: u64,
    /// Interval between activity sweeps.
    pub activity_sweep_interval_secs: u64,
    /// Interval between lockout sweeps.
    pub lockout_sweep_interval_secs: u64,

    // ── Authentication lockout ──────────────────────────────────────────────
    /// Sliding window for counting login failures per (address, email) pair.
    pub lockout_window_secs: u64,
    /// Failures at or above this count within the window reject logins.
    pub lockout_limit: u32,
    /// A preventive notice is dispatched when this count is first reached.
    pub lockout_warn_at: u32,
    /// Grace past the window before an idle lockout entry is swept.
    pub lockout_idle_grace_secs: u64,

    // ── Escalation dispatch ─────────────────────────────────────────────────
    /// Maximum escalations waiting for the background worker; overflow drops
    /// the oldest pending entry.
    pub escalation_queue_depth: usize,

    pub weights: SignalWeights,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            admin_bind: "127.0.0.1:9100".to_string(),
            upload_burst_window_secs: 300,
            upload_burst_limit: 5,
            daily_quota_free: 10,
            daily_quota_premium: 1000,
            login_window_secs: 600,
            login_failure_limit: 5,
            distinct_address_limit: 3,
            profile_window_secs: 3600,
            profile_edit_limit: 3,
            api_window_secs: 60,
            api_request_limit: 100,
            interval_min_samples: 10,
            interval_variance_ms2: 100.0,
            interval_mean_ms: 1000.0,
            endpoint_repeat_limit: 20,
            new_account_age_hours: 24,
            off_hours_start: 2,
            off_hours_end: 6,
            warning_threshold: 40,
            critical_threshold: 70,
            block_duration_secs: 900,
            retention_horizon_secs: 3600,
            activity_idle_horizon_secs: 21_600,
            activity_sweep_interval_secs: 3600,
            lockout_sweep_interval_secs: 300,
            lockout_window_secs: 900,
            lockout_limit: 5,
            lockout_warn_at: 3,
            lockout_idle_grace_secs: 900,
            escalation_queue_depth: 256,
            weights: SignalWeights::default(),
        }
    }
}

impl RiskConfig {
    /// Checks every invariant the engine relies on. Called by
    /// `RiskEngine::new` so a bad config can never reach the request path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.warning_threshold == 0 || self.warning_threshold > 100 {
            return Err(ConfigError::WarningThresholdOutOfRange(
                self.warning_threshold,
            ));
        }
        if self.critical_threshold == 0 || self.critical_threshold > 100 {
            return Err(ConfigError::CriticalThresholdOutOfRange(
                self.critical_threshold,
            ));
        }
        if self.warning_threshold >= self.critical_threshold {
            return Err(ConfigError::ThresholdOrder {
                warning: self.warning_threshold,
                critical: self.critical_threshold,
            });
        }

        for (name, secs) in [
            ("upload_burst_window_secs", self.upload_burst_window_secs),
            ("login_window_secs", self.login_window_secs),
            ("profile_window_secs", self.profile_window_secs),
            ("api_window_secs", self.api_window_secs),
            ("block_duration_secs", self.block_duration_secs),
            ("retention_horizon_secs", self.retention_horizon_secs),
            ("activity_idle_horizon_secs", self.activity_idle_horizon_secs),
            (
                "activity_sweep_interval_secs",
                self.activity_sweep_interval_secs,
            ),
            (
                "lockout_sweep_interval_secs",
                self.lockout_sweep_interval_secs,
            ),
            ("lockout_window_secs", self.lockout_window_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::ZeroDuration { name });
            }
        }

        for (name, limit) in [
            ("upload_burst_limit", self.upload_burst_limit),
            ("login_failure_limit", self.login_failure_limit),
            ("distinct_address_limit", self.distinct_address_limit),
            ("profile_edit_limit", self.profile_edit_limit),
            ("api_request_limit", self.api_request_limit),
            ("endpoint_repeat_limit", self.endpoint_repeat_limit),
            ("lockout_limit", self.lockout_limit),
            ("lockout_warn_at", self.lockout_warn_at),
        ] {
            if limit == 0 {
                return Err(ConfigError::ZeroLimit { name });
            }
        }
        if self.escalation_queue_depth == 0 {
            return Err(ConfigError::ZeroLimit {
                name: "escalation_queue_depth",
            });
        }
        if self.lockout_warn_at > self.lockout_limit {
            return Err(ConfigError::LockoutOrder {
                warn_at: self.lockout_warn_at,
                limit: self.lockout_limit,
            });
        }
        if self.off_hours_start >= self.off_hours_end || self.off_hours_end > 24 {
            return Err(ConfigError::OffHoursRange {
                start: self.off_hours_start,
                end: self.off_hours_end,
            });
        }
        Ok(())
    }

    pub fn upload_burst_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.upload_burst_window_secs as i64)
    }

    pub fn login_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.login_window_secs as i64)
    }

    pub fn profile_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.profile_window_secs as i64)
    }

    pub fn api_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.api_window_secs as i64)
    }

    pub fn block_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.block_duration_secs as i64)
    }

    pub fn retention_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_horizon_secs as i64)
    }

    pub fn activity_idle_horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.activity_idle_horizon_secs as i64)
    }

    pub fn lockout_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lockout_window_secs as i64)
    }

    pub fn lockout_idle_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lockout_idle_grace_secs as i64)
    }

    pub fn new_account_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.new_account_age_hours as i64)
    }
}

/// Loads the engine configuration from a JSON file. A missing file falls
/// back to defaults with a warning; a malformed file is a startup error and
/// panics with the parse failure.
pub fn load_config(path: &str) -> RiskConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: RiskConfig = serde_json::from_str(&content)
                .unwrap_or_else(|e| panic!("Configuration error in '{path}': {e}"));
            tracing::info!("Loaded config from {}", path);
            cfg
        }
        Err(_) => {
            tracing::warn!("Could not find {}, using default config", path);
            RiskConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RiskConfig::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_order_enforced() {
        let mut cfg = RiskConfig::default();
        cfg.warning_threshold = 80;
        cfg.critical_threshold = 70;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut cfg = RiskConfig::default();
        cfg.api_window_secs = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZeroDuration { .. })
        ));
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let mut cfg = RiskConfig::default();
        cfg.escalation_queue_depth = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_lockout_warn_above_limit_rejected() {
        let mut cfg = RiskConfig::default();
        cfg.lockout_warn_at = 7;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::LockoutOrder { .. })
        ));
    }

    #[test]
    fn test_off_hours_range_checked() {
        let mut cfg = RiskConfig::default();
        cfg.off_hours_start = 6;
        cfg.off_hours_end = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: RiskConfig =
            serde_json::from_str(r#"{"critical_threshold": 90, "workers": 8}"#).unwrap();
        assert_eq!(cfg.critical_threshold, 90);
        assert_eq!(cfg.workers, 8);
        assert_eq!(cfg.warning_threshold, 40);
        assert!(cfg.validate().is_ok());
    }
}
