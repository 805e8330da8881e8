pub mod ledger;
pub mod policy;
pub mod score;

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::EngineMetrics;
use crate::clock::Clock;
use crate::config::{ConfigError, RiskConfig};
use crate::escalation::{Dispatcher, Escalation};
use crate::lockout::LockoutTracker;
use ledger::{ActivityCategory, ActivityLedger, META_ADDRESS};
use policy::{RiskState, RiskStatus};
use score::{StaticSignals, UaRules};

/// The engine's answer for one request or login attempt.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allow: bool,
    pub reason: String,
    /// How long the caller should wait before retrying, when rejected.
    pub retry_after: Option<std::time::Duration>,
}

impl Decision {
    fn allowed() -> Self {
        Self {
            allow: true,
            reason: "ok".to_string(),
            retry_after: None,
        }
    }
}

/// The behavioral risk engine: activity ledger, scorer, and policy machine
/// behind one facade, plus the independent login lockout gate.
///
/// Safe to share across request tasks: every per-identity mutation happens
/// under the owning entry's shard guard, and nothing on the evaluation path
/// blocks on I/O — escalations leave through the non-blocking dispatcher.
pub struct RiskEngine {
    config: RiskConfig,
    clock: Arc<dyn Clock>,
    ledger: ActivityLedger,
    states: DashMap<String, RiskState>,
    lockout: LockoutTracker,
    ua_rules: UaRules,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<EngineMetrics>,
}

impl RiskEngine {
    /// Validates the configuration and builds the engine. A config the
    /// policy machine cannot safely run with is rejected here, never on the
    /// request path.
    pub fn new(
        config: RiskConfig,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ledger = ActivityLedger::new(config.retention_horizon(), clock.clone());
        let lockout = LockoutTracker::new(&config, clock.clone(), dispatcher.clone());
        Ok(Self {
            ua_rules: UaRules::new(),
            config,
            clock,
            ledger,
            states: DashMap::new(),
            lockout,
            dispatcher,
            metrics,
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Records one event for the identity, recomputes its score, and runs
    /// the policy machine. Called from the gateway's request middleware.
    ///
    /// Only an explicit blocked status rejects; the engine's own
    /// bookkeeping can never fail a request.
    pub fn evaluate_request(
        &self,
        key: &str,
        category: ActivityCategory,
        metadata: HashMap<String, String>,
        signals: &StaticSignals,
    ) -> Decision {
        self.ledger.record(key, category, metadata.clone());
        let snapshot = self.ledger.snapshot(key, &self.config);
        let (score_value, reasons) = score::score(
            &snapshot,
            signals,
            self.clock.local_hour(),
            &self.config,
            &self.ua_rules,
        );

        let now = self.clock.now();
        let (outcome, freshly_blocked) = {
            let mut state = self
                .states
                .entry(key.to_string())
                .or_insert_with(|| RiskState::new(now));
            let was_blocked = state.status == RiskStatus::Blocked;
            let outcome = policy::transition(state.value_mut(), score_value, now, &self.config);
            let freshly_blocked = !was_blocked && outcome.status == RiskStatus::Blocked;
            (outcome, freshly_blocked)
        };

        if let Some(severity) = outcome.escalate {
            info!(
                "Escalating identity {} at severity {} (score {})",
                key,
                severity.as_str(),
                score_value
            );
            self.dispatcher.dispatch(Escalation::AbuseReport {
                identity: key.to_string(),
                severity,
                score: score_value,
                reasons: reasons.clone(),
                evidence: metadata,
            });
        }

        self.metrics
            .tracked_identities
            .set(self.ledger.tracked_identities() as i64);
        if freshly_blocked {
            self.metrics.blocks_total.inc();
        }

        if outcome.allow {
            self.metrics.decisions_total.with_label_values(&["allow"]).inc();
            debug!("Allowing {} (score {})", key, score_value);
            Decision::allowed()
        } else {
            self.metrics.decisions_total.with_label_values(&["block"]).inc();
            warn!(
                "Rejecting {} (score {}): {}",
                key,
                score_value,
                reasons.join("; ")
            );
            Decision {
                allow: false,
                reason: format!("blocked: score {} ({})", score_value, reasons.join("; ")),
                retry_after: outcome
                    .retry_after
                    .map(|d| d.to_std().unwrap_or_default()),
            }
        }
    }

    /// Gate for the authentication endpoint, checked before credentials are
    /// even looked at. A locked-out pair gets a hard reject with the
    /// remaining duration.
    pub fn evaluate_login(&self, address: &str, email: &str) -> Decision {
        let (blocked, remaining) = self.lockout.is_blocked(address, email);
        if blocked {
            self.metrics.lockout_rejections_total.inc();
            warn!("Rejecting login for {} from {}: locked out", email, address);
            Decision {
                allow: false,
                reason: "too many failed login attempts".to_string(),
                retry_after: Some(remaining.to_std().unwrap_or_default()),
            }
        } else {
            Decision::allowed()
        }
    }

    /// Called after a failed credential check. Feeds both the lockout
    /// tracker (keyed by address + email) and the claimed account's
    /// activity ledger, so the scorer can see failures converging on one
    /// account from many addresses.
    pub fn record_login_failure(&self, address: &str, email: &str) {
        self.lockout.record_failure(address, email);
        let mut metadata = HashMap::new();
        metadata.insert(META_ADDRESS.to_string(), address.to_string());
        self.ledger
            .record(email, ActivityCategory::LoginFailure, metadata);
    }

    /// Current policy state for an identity, if it is tracked.
    pub fn risk_status(&self, key: &str) -> Option<RiskState> {
        self.states.get(key).map(|s| s.value().clone())
    }

    /// Evicts identities (ledger windows and risk states) idle past the
    /// configured horizon. Returns the number of evicted entries.
    pub fn sweep_activity(&self) -> usize {
        let horizon = self.config.activity_idle_horizon();
        let mut removed = self.ledger.sweep(horizon);

        let cutoff = self.clock.now() - horizon;
        let before = self.states.len();
        self.states.retain(|_, state| state.last_activity >= cutoff);
        removed += before.saturating_sub(self.states.len());

        self.metrics
            .swept_entries_total
            .with_label_values(&["activity"])
            .inc_by(removed as u64);
        self.metrics
            .tracked_identities
            .set(self.ledger.tracked_identities() as i64);
        removed
    }

    /// Evicts stale lockout entries. Returns the number of evicted pairs.
    pub fn sweep_lockouts(&self) -> usize {
        let removed = self.lockout.sweep();
        self.metrics
            .swept_entries_total
            .with_label_values(&["lockout"])
            .inc_by(removed as u64);
        removed
    }
}

/// Background task that periodically evicts idle state, shard by shard.
/// Stops when the token is cancelled.
pub fn spawn_sweeper(engine: Arc<RiskEngine>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    let activity_every =
        std::time::Duration::from_secs(engine.config().activity_sweep_interval_secs);
    let lockout_every = std::time::Duration::from_secs(engine.config().lockout_sweep_interval_secs);

    tokio::spawn(async move {
        let mut activity = tokio::time::interval(activity_every);
        let mut lockouts = tokio::time::interval(lockout_every);
        // Both intervals fire immediately on the first tick; sweeping an
        // empty table is a no-op, so let them.
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = activity.tick() => {
                    engine.sweep_activity();
                }
                _ = lockouts.tick() => {
                    engine.sweep_lockouts();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::score::AccountPlan;
    use chrono::{Duration, TimeZone, Utc};

    fn make_engine() -> (RiskEngine, Arc<ManualClock>, Arc<Dispatcher>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(32, metrics.clone()));
        let engine = RiskEngine::new(
            RiskConfig::default(),
            clock.clone(),
            dispatcher.clone(),
            metrics,
        )
        .unwrap();
        (engine, clock, dispatcher)
    }

    fn browser() -> StaticSignals {
        StaticSignals {
            user_agent: Some("Mozilla/5.0 Firefox/126.0".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut cfg = RiskConfig::default();
        cfg.warning_threshold = 90;
        cfg.critical_threshold = 50;
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(32, metrics.clone()));
        assert!(RiskEngine::new(cfg, clock, dispatcher, metrics).is_err());
    }

    #[test]
    fn test_quiet_traffic_is_allowed() {
        let (engine, _clock, _) = make_engine();
        let decision = engine.evaluate_request(
            "user-1",
            ActivityCategory::Request,
            HashMap::new(),
            &browser(),
        );
        assert!(decision.allow);
        assert_eq!(engine.risk_status("user-1").unwrap().score, 0);
    }

    #[test]
    fn test_upload_burst_raises_score_without_blocking() {
        let (engine, clock, _) = make_engine();
        let signals = StaticSignals {
            plan: AccountPlan::Premium,
            ..browser()
        };

        let mut last = None;
        for _ in 0..7 {
            last = Some(engine.evaluate_request(
                "user-1",
                ActivityCategory::Upload,
                HashMap::new(),
                &signals,
            ));
            clock.advance(Duration::seconds(10));
        }
        assert!(last.unwrap().allow, "a lone burst stays under warning");
        let state = engine.risk_status("user-1").unwrap();
        assert_eq!(state.score, 30);
        assert_eq!(state.status, RiskStatus::Normal);
    }

    #[test]
    fn test_credential_stuffing_blocks_the_account() {
        let (engine, _clock, dispatcher) = make_engine();

        // Six failures against one account from three addresses.
        for addr in ["1.1.1.1", "2.2.2.2", "3.3.3.3", "1.1.1.1", "2.2.2.2", "3.3.3.3"] {
            engine.record_login_failure(addr, "victim@vault.io");
        }
        let drained_notices = dispatcher.pending();

        // The next scored event for the account sees failed_logins (25) +
        // multi_address (10) + quota breach (30) + scripted agent (15) = 80.
        let signals = StaticSignals {
            uploads_today: 11,
            user_agent: Some("curl/8.4.0".to_string()),
            ..Default::default()
        };
        let decision = engine.evaluate_request(
            "victim@vault.io",
            ActivityCategory::Request,
            HashMap::new(),
            &signals,
        );
        assert!(!decision.allow);
        assert_eq!(
            decision.retry_after,
            Some(std::time::Duration::from_secs(900))
        );
        let state = engine.risk_status("victim@vault.io").unwrap();
        assert_eq!(state.status, RiskStatus::Blocked);
        assert_eq!(
            dispatcher.pending(),
            drained_notices + 1,
            "exactly one abuse report joins the lockout notices"
        );
    }

    #[test]
    fn test_lockout_gates_login_before_scoring() {
        let (engine, _clock, _) = make_engine();

        for _ in 0..5 {
            engine.record_login_failure("9.9.9.9", "a@b.com");
        }
        let decision = engine.evaluate_login("9.9.9.9", "a@b.com");
        assert!(!decision.allow);
        assert_eq!(
            decision.retry_after,
            Some(std::time::Duration::from_secs(900))
        );

        // Other pairs are unaffected.
        assert!(engine.evaluate_login("9.9.9.9", "c@d.com").allow);
    }

    #[test]
    fn test_sweep_forgets_idle_identities() {
        let (engine, clock, _) = make_engine();

        engine.evaluate_request(
            "user-1",
            ActivityCategory::Upload,
            HashMap::new(),
            &browser(),
        );
        assert!(engine.risk_status("user-1").is_some());

        clock.advance(Duration::hours(7));
        let removed = engine.sweep_activity();
        assert_eq!(removed, 2, "ledger window and risk state both evicted");
        assert!(engine.risk_status("user-1").is_none());

        // Next access starts over from a fresh state at score zero.
        let decision = engine.evaluate_request(
            "user-1",
            ActivityCategory::Request,
            HashMap::new(),
            &browser(),
        );
        assert!(decision.allow);
        assert_eq!(engine.risk_status("user-1").unwrap().score, 0);
    }
}
