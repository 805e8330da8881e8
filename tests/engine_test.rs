//! Integration tests for the vaultguard risk engine.
//!
//! These drive the public crate API end to end — ledger, scorer, policy
//! machine, lockout tracker, and escalation dispatch — with a hand-driven
//! clock so window expiry is deterministic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use vaultguard::admin::EngineMetrics;
use vaultguard::*;

fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

fn make_engine() -> (Arc<RiskEngine>, Arc<ManualClock>, Arc<Dispatcher>) {
    let clock = Arc::new(ManualClock::new(start_time()));
    let metrics = Arc::new(EngineMetrics::new());
    let dispatcher = Arc::new(Dispatcher::new(64, metrics.clone()));
    let engine = Arc::new(
        RiskEngine::new(
            RiskConfig::default(),
            clock.clone(),
            dispatcher.clone(),
            metrics,
        )
        .expect("default config is valid"),
    );
    (engine, clock, dispatcher)
}

fn browser() -> StaticSignals {
    StaticSignals {
        user_agent: Some("Mozilla/5.0 (X11; Linux x86_64) Firefox/126.0".to_string()),
        ..Default::default()
    }
}

/// Pushes an otherwise quiet identity over the critical threshold:
/// quota breach (30) + scripted agent (15) + six failed logins (25) from
/// three addresses (10) = 80. The failures are spread two per
/// (address, email) pair, deliberately under the lockout tracker's notice
/// marks, so only the risk side reacts.
fn hostile_setup(engine: &RiskEngine, email: &str) -> StaticSignals {
    for addr in ["1.1.1.1", "2.2.2.2", "3.3.3.3", "1.1.1.1", "2.2.2.2", "3.3.3.3"] {
        engine.record_login_failure(addr, email);
    }
    StaticSignals {
        uploads_today: 11,
        user_agent: Some("python-requests/2.31".to_string()),
        ..Default::default()
    }
}

#[test]
fn test_block_rejects_until_expiry_then_resets() {
    let (engine, clock, _) = make_engine();
    let signals = hostile_setup(&engine, "victim@vault.io");

    let first = engine.evaluate_request(
        "victim@vault.io",
        ActivityCategory::Request,
        HashMap::new(),
        &signals,
    );
    assert!(!first.allow, "score 80 crosses the critical threshold");
    assert_eq!(first.retry_after, Some(std::time::Duration::from_secs(900)));

    // Every call during the block is rejected, with a shrinking remainder.
    clock.advance(Duration::minutes(5));
    let mid = engine.evaluate_request(
        "victim@vault.io",
        ActivityCategory::Request,
        HashMap::new(),
        &browser(),
    );
    assert!(!mid.allow);
    assert_eq!(mid.retry_after, Some(std::time::Duration::from_secs(600)));

    // Past expiry the very next call unblocks; with calm signals the
    // recomputed score is back under warning (the login failures have aged
    // out of their 10-minute window by now) and the status resets.
    clock.advance(Duration::minutes(11));
    let after = engine.evaluate_request(
        "victim@vault.io",
        ActivityCategory::Request,
        HashMap::new(),
        &browser(),
    );
    assert!(after.allow);
    assert_eq!(
        engine.risk_status("victim@vault.io").unwrap().status,
        RiskStatus::Normal
    );
}

#[test]
fn test_one_critical_escalation_per_incident() {
    let (engine, clock, dispatcher) = make_engine();
    let signals = hostile_setup(&engine, "victim@vault.io");
    assert_eq!(dispatcher.pending(), 0, "no lockout notices from the setup");

    // First critical evaluation: one abuse report.
    engine.evaluate_request(
        "victim@vault.io",
        ActivityCategory::Request,
        HashMap::new(),
        &signals,
    );
    assert_eq!(dispatcher.pending(), 1);

    // Drive the score critical a second time after the block expires,
    // without it ever dropping below warning in between: still one report.
    clock.advance(Duration::minutes(16));
    hostile_setup(&engine, "victim@vault.io");
    let rejected = engine.evaluate_request(
        "victim@vault.io",
        ActivityCategory::Request,
        HashMap::new(),
        &signals,
    );
    assert!(!rejected.allow, "re-blocked on the still-critical score");
    assert_eq!(dispatcher.pending(), 1, "incident latch suppresses a repeat");

    // Let everything cool down so the incident closes...
    clock.advance(Duration::hours(2));
    let calm = engine.evaluate_request(
        "victim@vault.io",
        ActivityCategory::Request,
        HashMap::new(),
        &browser(),
    );
    assert!(calm.allow);

    // ...then a fresh incident produces a fresh report.
    let signals = hostile_setup(&engine, "victim@vault.io");
    engine.evaluate_request(
        "victim@vault.io",
        ActivityCategory::Request,
        HashMap::new(),
        &signals,
    );
    assert_eq!(dispatcher.pending(), 2);
}

#[test]
fn test_warned_band_allows_with_single_medium_escalation() {
    let (engine, clock, dispatcher) = make_engine();

    // Quota breach (30) + scripted agent (15) = 45: warned, not blocked.
    let signals = StaticSignals {
        uploads_today: 11,
        user_agent: Some("curl/8.4.0".to_string()),
        ..Default::default()
    };
    for _ in 0..3 {
        let decision = engine.evaluate_request(
            "user-9",
            ActivityCategory::Request,
            HashMap::new(),
            &signals,
        );
        assert!(decision.allow, "warned identities are not rejected");
        clock.advance(Duration::seconds(30));
    }
    assert_eq!(
        engine.risk_status("user-9").unwrap().status,
        RiskStatus::Warned
    );
    assert_eq!(dispatcher.pending(), 1, "one medium report for the incident");
}

#[test]
fn test_lockout_five_failures_then_sliding_expiry() {
    let (engine, clock, _) = make_engine();

    for _ in 0..5 {
        engine.record_login_failure("1.2.3.4", "a@b.com");
    }
    let decision = engine.evaluate_login("1.2.3.4", "a@b.com");
    assert!(!decision.allow);
    assert_eq!(
        decision.retry_after,
        Some(std::time::Duration::from_secs(900)),
        "all failures just landed, so the block runs the full window"
    );

    // After the window has fully elapsed since the first failure, the
    // count is back to zero; a sixth failure alone does not re-block.
    clock.advance(Duration::minutes(16));
    engine.record_login_failure("1.2.3.4", "a@b.com");
    assert!(engine.evaluate_login("1.2.3.4", "a@b.com").allow);
}

#[test]
fn test_premium_upload_burst_contributes_thirty() {
    let (engine, clock, _) = make_engine();
    let signals = StaticSignals {
        plan: AccountPlan::Premium,
        user_agent: Some("Mozilla/5.0 Firefox/126.0".to_string()),
        ..Default::default()
    };

    for _ in 0..6 {
        engine.evaluate_request("premium-1", ActivityCategory::Upload, HashMap::new(), &signals);
        clock.advance(Duration::seconds(20));
    }
    let state = engine.risk_status("premium-1").unwrap();
    assert_eq!(state.score, 30);
    assert_eq!(state.status, RiskStatus::Normal);
}

#[test]
fn test_sweep_evicts_idle_state_and_is_idempotent() {
    let (engine, clock, _) = make_engine();

    engine.evaluate_request("user-1", ActivityCategory::Request, HashMap::new(), &browser());
    engine.record_login_failure("7.7.7.7", "user-1@vault.io");

    clock.advance(Duration::hours(7));
    assert!(engine.sweep_activity() > 0);
    assert!(engine.sweep_lockouts() > 0);
    assert!(engine.risk_status("user-1").is_none());

    // No new events in between: the second sweep finds nothing.
    assert_eq!(engine.sweep_activity(), 0);
    assert_eq!(engine.sweep_lockouts(), 0);

    // The identity starts over from scratch on its next request.
    engine.evaluate_request("user-1", ActivityCategory::Request, HashMap::new(), &browser());
    assert_eq!(engine.risk_status("user-1").unwrap().score, 0);
}

#[test]
fn test_concurrent_evaluation_is_safe() {
    let (engine, _clock, _) = make_engine();

    // Hammer the same identity and distinct identities from eight threads;
    // nothing should panic or deadlock, and every event must land.
    let threads: Vec<_> = (0..8)
        .map(|t| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let key = if t % 2 == 0 {
                        "shared".to_string()
                    } else {
                        format!("user-{t}-{i}")
                    };
                    let decision = engine.evaluate_request(
                        &key,
                        ActivityCategory::Request,
                        HashMap::new(),
                        &StaticSignals {
                            user_agent: Some("Mozilla/5.0 Firefox/126.0".to_string()),
                            ..Default::default()
                        },
                    );
                    assert!(decision.allow);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    // 4 threads * 50 events each on the shared key, all within the window.
    let state = engine.risk_status("shared").unwrap();
    assert!(state.score <= 100);
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<(String, Severity)>>,
    notices: Mutex<Vec<String>>,
}

impl EscalationSink for RecordingSink {
    fn create_report(
        &self,
        identity: &str,
        _kind: &str,
        severity: Severity,
        _reasons: &[String],
        _evidence: &HashMap<String, String>,
    ) {
        self.reports
            .lock()
            .unwrap()
            .push((identity.to_string(), severity));
    }

    fn notify_admin(&self, subject: &str, _body: &str) {
        self.notices.lock().unwrap().push(subject.to_string());
    }
}

#[tokio::test]
async fn test_escalations_reach_the_sink_off_the_request_path() {
    let (engine, _clock, dispatcher) = make_engine();
    let sink = Arc::new(RecordingSink::default());
    let token = CancellationToken::new();
    let worker = escalation::spawn_worker(dispatcher.clone(), sink.clone(), token.clone());

    let signals = hostile_setup(&engine, "victim@vault.io");
    // Five more failures on a single pair take the lockout tracker through
    // both of its notice marks.
    for _ in 0..5 {
        engine.record_login_failure("8.8.8.8", "victim@vault.io");
    }
    let decision = engine.evaluate_request(
        "victim@vault.io",
        ActivityCategory::Request,
        HashMap::new(),
        &signals,
    );
    assert!(!decision.allow);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    token.cancel();
    worker.await.unwrap();

    let reports = sink.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "victim@vault.io");
    assert_eq!(reports[0].1, Severity::Critical);
    // Preventive + lockout notices from the tracker, plus the critical
    // block notice.
    assert_eq!(sink.notices.lock().unwrap().len(), 3);
}
