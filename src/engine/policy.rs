use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::RiskConfig;
use crate::escalation::Severity;

/// Where an identity currently stands with the policy machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskStatus {
    Normal,
    Warned,
    Blocked,
}

/// Mutable policy state for one identity. All transitions happen under the
/// owning entry's shard guard.
///
/// Invariant: `status == Blocked` exactly when `block_until` is set and in
/// the future. `incident_reported` stays latched while the score remains at
/// or above the warning threshold and clears once it drops below, arming
/// the next incident for a fresh escalation.
#[derive(Debug, Clone)]
pub struct RiskState {
    pub score: u8,
    pub status: RiskStatus,
    pub block_until: Option<DateTime<Utc>>,
    pub incident_reported: bool,
    pub last_activity: DateTime<Utc>,
}

impl RiskState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            score: 0,
            status: RiskStatus::Normal,
            block_until: None,
            incident_reported: false,
            last_activity: now,
        }
    }
}

/// What the policy machine decided for one request.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub allow: bool,
    pub status: RiskStatus,
    /// How long the caller should wait before retrying, when rejected.
    pub retry_after: Option<Duration>,
    /// Escalation to dispatch, at most one per incident.
    pub escalate: Option<Severity>,
}

/// Applies one freshly computed score to the identity's state.
///
/// The transition is a pure function of the score and the previous state:
/// an expired block is cleared first (lazily, on access — there is no
/// unblock timer), then the score is mapped onto normal/warned/blocked with
/// the escalation latch deciding whether a report goes out.
pub fn transition(
    state: &mut RiskState,
    score: u8,
    now: DateTime<Utc>,
    config: &RiskConfig,
) -> PolicyOutcome {
    state.last_activity = now;
    state.score = score;

    // Lazy auto-unblock: an expired block clears before the new score is
    // considered, independent of which request happened to arrive.
    if state.status == RiskStatus::Blocked {
        match state.block_until {
            Some(until) if now >= until => {
                state.status = RiskStatus::Normal;
                state.block_until = None;
            }
            Some(until) => {
                let remaining = until - now;
                // A negative remainder can only come from an inconsistent
                // clock; clamp rather than reject on bookkeeping grounds.
                let remaining = if remaining < Duration::zero() {
                    warn!("block_until in the past survived the expiry check; clamping");
                    Duration::zero()
                } else {
                    remaining
                };
                return PolicyOutcome {
                    allow: false,
                    status: RiskStatus::Blocked,
                    retry_after: Some(remaining),
                    escalate: None,
                };
            }
            None => {
                // Blocked without a deadline violates the state invariant;
                // recover to normal instead of rejecting forever.
                warn!("blocked state without block_until; resetting to normal");
                state.status = RiskStatus::Normal;
            }
        }
    }

    if score >= config.critical_threshold {
        state.status = RiskStatus::Blocked;
        state.block_until = Some(now + config.block_duration());
        let escalate = if state.incident_reported {
            None
        } else {
            state.incident_reported = true;
            Some(Severity::Critical)
        };
        PolicyOutcome {
            allow: false,
            status: RiskStatus::Blocked,
            retry_after: Some(config.block_duration()),
            escalate,
        }
    } else if score >= config.warning_threshold {
        state.status = RiskStatus::Warned;
        state.block_until = None;
        let escalate = if state.incident_reported {
            None
        } else {
            state.incident_reported = true;
            Some(Severity::Medium)
        };
        PolicyOutcome {
            allow: true,
            status: RiskStatus::Warned,
            retry_after: None,
            escalate,
        }
    } else {
        state.status = RiskStatus::Normal;
        state.block_until = None;
        // Score back under the warning mark ends the incident and re-arms
        // escalation for the next one.
        state.incident_reported = false;
        PolicyOutcome {
            allow: true,
            status: RiskStatus::Normal,
            retry_after: None,
            escalate: None,
        }
    }
}
