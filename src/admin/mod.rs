use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::info;

/// Global metrics registry shared across the engine and the admin server.
#[derive(Clone)]
pub struct EngineMetrics {
    pub registry: Registry,
    /// Total evaluated requests, labeled by outcome (allow / block).
    pub decisions_total: IntCounterVec,
    /// Total transitions into the blocked state.
    pub blocks_total: IntCounter,
    /// Total escalations delivered to the sink, labeled by kind.
    pub escalations_total: IntCounterVec,
    /// Escalations dropped because the dispatch queue was full.
    pub escalations_dropped_total: IntCounter,
    /// Login attempts rejected by the lockout tracker.
    pub lockout_rejections_total: IntCounter,
    /// Entries evicted by the periodic sweeps, labeled by kind.
    pub swept_entries_total: IntCounterVec,
    /// Identities currently tracked by the ledger.
    pub tracked_identities: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let decisions_total = IntCounterVec::new(
            Opts::new(
                "vaultguard_decisions_total",
                "Total evaluated requests by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        let blocks_total = IntCounter::new(
            "vaultguard_blocks_total",
            "Total transitions into the blocked state",
        )
        .unwrap();

        let escalations_total = IntCounterVec::new(
            Opts::new(
                "vaultguard_escalations_total",
                "Total escalations delivered by kind",
            ),
            &["kind"],
        )
        .unwrap();

        let escalations_dropped_total = IntCounter::new(
            "vaultguard_escalations_dropped_total",
            "Escalations dropped due to a full dispatch queue",
        )
        .unwrap();

        let lockout_rejections_total = IntCounter::new(
            "vaultguard_lockout_rejections_total",
            "Login attempts rejected by the lockout tracker",
        )
        .unwrap();

        let swept_entries_total = IntCounterVec::new(
            Opts::new(
                "vaultguard_swept_entries_total",
                "Entries evicted by periodic sweeps",
            ),
            &["kind"],
        )
        .unwrap();

        let tracked_identities = IntGauge::new(
            "vaultguard_tracked_identities",
            "Identities currently tracked by the activity ledger",
        )
        .unwrap();

        // Register all metrics
        registry.register(Box::new(decisions_total.clone())).unwrap();
        registry.register(Box::new(blocks_total.clone())).unwrap();
        registry
            .register(Box::new(escalations_total.clone()))
            .unwrap();
        registry
            .register(Box::new(escalations_dropped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(lockout_rejections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(swept_entries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(tracked_identities.clone()))
            .unwrap();

        Self {
            registry,
            decisions_total,
            blocks_total,
            escalations_total,
            escalations_dropped_total,
            lockout_rejections_total,
            swept_entries_total,
            tracked_identities,
        }
    }

    /// Encodes all registered metrics into Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[get("/metrics")]
async fn metrics_endpoint(metrics: web::Data<Arc<EngineMetrics>>) -> impl Responder {
    let body = metrics.encode();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(body)
}

#[get("/api/stats")]
async fn api_stats(metrics: web::Data<Arc<EngineMetrics>>) -> impl Responder {
    // A simplified JSON shape for dashboards that don't speak the
    // Prometheus exposition format: one array of labeled values per family.
    let mut stats = serde_json::Map::new();
    for family in metrics.registry.gather() {
        let mut values = vec![];
        for m in family.get_metric() {
            let mut labels = serde_json::Map::new();
            for lp in m.get_label() {
                labels.insert(
                    lp.get_name().to_string(),
                    serde_json::Value::String(lp.get_value().to_string()),
                );
            }
            let value = if m.has_counter() {
                m.get_counter().get_value()
            } else if m.has_gauge() {
                m.get_gauge().get_value()
            } else {
                0.0
            };
            values.push(serde_json::json!({ "labels": labels, "value": value }));
        }
        stats.insert(family.get_name().to_string(), serde_json::json!(values));
    }
    HttpResponse::Ok().json(stats)
}

/// Runs the admin API until the process exits.
pub async fn start_admin_server(bind_addr: String, metrics: Arc<EngineMetrics>) {
    info!("Admin API listening on http://{}", bind_addr);

    let metrics_data = web::Data::new(metrics);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(metrics_data.clone())
            .service(health)
            .service(metrics_endpoint)
            .service(api_stats)
    })
    .bind(&bind_addr)
    .expect("Invalid admin bind address")
    .run();

    if let Err(e) = server.await {
        tracing::error!("Admin server error: {}", e);
    }
}
