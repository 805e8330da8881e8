//! Behavioral risk engine for the vault platform.
//!
//! Watches per-identity activity (uploads, login failures, profile edits,
//! API calls) in sliding windows, computes a composite abuse score with
//! itemized reasons, and drives a block/warn state machine with
//! deduplicated escalations. A separate lockout tracker gates the
//! authentication endpoint by (address, email) pair.
//!
//! All state is in-memory and process-local; the surrounding service calls
//! [`engine::RiskEngine::evaluate_request`] from its request middleware and
//! the login hooks around authentication.

pub mod admin;
pub mod clock;
pub mod config;
pub mod engine;
pub mod escalation;
pub mod identity;
pub mod lockout;
pub mod telemetry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, RiskConfig, SignalWeights};
pub use engine::ledger::{ActivityCategory, ActivityEvent, META_ADDRESS, META_ENDPOINT};
pub use engine::policy::RiskStatus;
pub use engine::score::{AccountPlan, StaticSignals};
pub use engine::{Decision, RiskEngine};
pub use escalation::{Dispatcher, Escalation, EscalationSink, LogSink, Severity};
pub use identity::{DefaultIdentitySource, IdentitySource, RequestContext};
