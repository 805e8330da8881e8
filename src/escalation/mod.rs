use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::admin::EngineMetrics;

/// How urgent an escalation is. Medium maps to the warned band, Critical to
/// a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Medium,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Medium => "medium",
            Severity::Critical => "critical",
        }
    }
}

/// A unit of asynchronous follow-up work triggered by a policy transition
/// or the lockout tracker. Carried across the bounded queue to the worker.
#[derive(Debug, Clone)]
pub enum Escalation {
    /// The policy machine crossed a threshold for an identity.
    AbuseReport {
        identity: String,
        severity: Severity,
        score: u8,
        reasons: Vec<String>,
        evidence: HashMap<String, String>,
    },
    /// Preventive notice: an (address, email) pair is accumulating login
    /// failures but has not hit the lockout limit yet.
    LoginFlood {
        address: String,
        email: String,
        failures: u32,
    },
    /// The lockout limit was crossed for an (address, email) pair.
    Lockout {
        address: String,
        email: String,
        failures: u32,
    },
}

/// Outbound collaborator for reports and admin notices. Implementations are
/// fire-and-forget: they log their own failures and never surface errors to
/// the request path.
pub trait EscalationSink: Send + Sync {
    fn create_report(
        &self,
        identity: &str,
        kind: &str,
        severity: Severity,
        reasons: &[String],
        evidence: &HashMap<String, String>,
    );

    fn notify_admin(&self, subject: &str, body: &str);
}

/// Default sink: writes every escalation to the log. The vault platform
/// swaps in its report store and mailer here.
pub struct LogSink;

impl EscalationSink for LogSink {
    fn create_report(
        &self,
        identity: &str,
        kind: &str,
        severity: Severity,
        reasons: &[String],
        _evidence: &HashMap<String, String>,
    ) {
        warn!(
            "Abuse report [{}] for {} ({}): {}",
            severity.as_str(),
            identity,
            kind,
            reasons.join("; ")
        );
    }

    fn notify_admin(&self, subject: &str, body: &str) {
        info!("Admin notice: {} — {}", subject, body);
    }
}

/// Bounded hand-off between the request path and the escalation worker.
///
/// `dispatch` never blocks: when the queue is full the OLDEST pending
/// escalation is dropped with a warning, so a slow sink can only cost
/// stale notifications, never request latency.
pub struct Dispatcher {
    queue: Mutex<VecDeque<Escalation>>,
    notify: Notify,
    depth: usize,
    metrics: Arc<EngineMetrics>,
}

impl Dispatcher {
    pub fn new(depth: usize, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            depth,
            metrics,
        }
    }

    /// Enqueues an escalation for the background worker. Non-blocking by
    /// construction.
    pub fn dispatch(&self, escalation: Escalation) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.depth {
                let dropped = queue.pop_front();
                self.metrics.escalations_dropped_total.inc();
                warn!(
                    "Escalation queue full ({}); dropping oldest pending entry: {:?}",
                    self.depth, dropped
                );
            }
            queue.push_back(escalation);
        }
        self.notify.notify_one();
    }

    /// Number of escalations currently waiting for the worker.
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn pop(&self) -> Option<Escalation> {
        self.queue.lock().unwrap().pop_front()
    }

    fn deliver(&self, sink: &dyn EscalationSink, escalation: Escalation) {
        match escalation {
            Escalation::AbuseReport {
                identity,
                severity,
                score,
                reasons,
                mut evidence,
            } => {
                evidence.insert("score".to_string(), score.to_string());
                sink.create_report(&identity, "abuse", severity, &reasons, &evidence);
                if severity == Severity::Critical {
                    sink.notify_admin(
                        &format!("Identity {} blocked", identity),
                        &format!("score {}: {}", score, reasons.join("; ")),
                    );
                }
                self.metrics
                    .escalations_total
                    .with_label_values(&[severity.as_str()])
                    .inc();
            }
            Escalation::LoginFlood {
                address,
                email,
                failures,
            } => {
                sink.notify_admin(
                    "Repeated login failures",
                    &format!("{} failures for {} from {}", failures, email, address),
                );
                self.metrics
                    .escalations_total
                    .with_label_values(&["login_flood"])
                    .inc();
            }
            Escalation::Lockout {
                address,
                email,
                failures,
            } => {
                sink.notify_admin(
                    "Login lockout engaged",
                    &format!("{} failures for {} from {}", failures, email, address),
                );
                self.metrics
                    .escalations_total
                    .with_label_values(&["lockout"])
                    .inc();
            }
        }
    }
}

/// Spawns the background worker that drains the queue and invokes the sink
/// off the request path. Runs until the token is cancelled; pending
/// escalations are drained before each sleep so cancellation loses at most
/// what was queued after the final wakeup.
pub fn spawn_worker(
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn EscalationSink>,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            while let Some(escalation) = dispatcher.pop() {
                dispatcher.deliver(sink.as_ref(), escalation);
            }
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Escalation worker shutting down");
                    break;
                }
                _ = dispatcher.notify.notified() => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn report_for(identity: &str) -> Escalation {
        Escalation::AbuseReport {
            identity: identity.to_string(),
            severity: Severity::Critical,
            score: 80,
            reasons: vec!["test".to_string()],
            evidence: HashMap::new(),
        }
    }

    fn make_dispatcher(depth: usize) -> Dispatcher {
        Dispatcher::new(depth, Arc::new(EngineMetrics::new()))
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let dispatcher = make_dispatcher(2);
        dispatcher.dispatch(report_for("first"));
        dispatcher.dispatch(report_for("second"));
        dispatcher.dispatch(report_for("third"));

        assert_eq!(dispatcher.pending(), 2);
        // "first" was the oldest pending entry and got dropped.
        match dispatcher.pop().unwrap() {
            Escalation::AbuseReport { identity, .. } => assert_eq!(identity, "second"),
            other => panic!("unexpected escalation: {:?}", other),
        }
        assert_eq!(dispatcher.metrics.escalations_dropped_total.get(), 1);
    }

    #[test]
    fn test_deliver_critical_report_notifies_admin() {
        let dispatcher = make_dispatcher(8);
        let sink = RecordingSink::default();

        dispatcher.deliver(&sink, report_for("user-7"));

        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0], ("user-7".to_string(), Severity::Critical));
        assert_eq!(sink.notices.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let dispatcher = Arc::new(make_dispatcher(8));
        let sink = Arc::new(RecordingSink::default());
        let token = CancellationToken::new();

        let handle = spawn_worker(dispatcher.clone(), sink.clone(), token.clone());

        dispatcher.dispatch(report_for("a"));
        dispatcher.dispatch(report_for("b"));

        // Give the worker a moment to drain, then stop it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(sink.reports.lock().unwrap().len(), 2);
    }
}
