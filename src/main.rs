use vaultguard::*;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The main entry point for the vaultguard risk engine service.
/// We use a standard synchronous `main` function here instead of
/// `#[tokio::main]` because we need to parse the configuration file
/// *before* building the async runtime to determine how many worker
/// threads the runtime should use.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Telemetry (Logging, Tracing)
    telemetry::init_telemetry();

    // 2. Load Configuration (Synchronous)
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "vaultguard.json".to_string());
    let cfg = config::load_config(&config_path);

    tracing::info!(
        "Starting risk engine with {} worker threads... (Config: {})",
        cfg.workers,
        config_path
    );

    // 3. Build Tokio Runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.workers)
        .enable_all()
        .build()?;

    // 4. Start the Async Application Block
    rt.block_on(async {
        // --- Graceful Shutdown ---
        // A CancellationToken propagates shutdown signals to all spawned tasks.
        let shutdown_token = CancellationToken::new();

        let shutdown_token_signal = shutdown_token.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received — stopping background tasks...");
            shutdown_token_signal.cancel();
        });

        // Metrics registry shared by the engine and the admin server.
        let metrics = Arc::new(admin::EngineMetrics::new());

        // Escalation dispatch: bounded queue, drained by a background worker.
        let dispatcher = Arc::new(Dispatcher::new(cfg.escalation_queue_depth, metrics.clone()));
        let sink: Arc<dyn EscalationSink> = Arc::new(LogSink);
        let worker = escalation::spawn_worker(
            dispatcher.clone(),
            sink,
            shutdown_token.clone(),
        );

        // The engine itself. A bad config is a startup error.
        let engine = Arc::new(
            RiskEngine::new(
                cfg.clone(),
                Arc::new(SystemClock),
                dispatcher,
                metrics.clone(),
            )
            .unwrap_or_else(|e| panic!("Configuration error: {e}")),
        );

        // Periodic eviction of idle per-identity and lockout state.
        let sweeper = engine::spawn_sweeper(engine.clone(), shutdown_token.clone());

        // Admin API (health, metrics) in the background.
        let admin_bind = cfg.admin_bind.clone();
        let metrics_admin = metrics.clone();
        tokio::spawn(async move {
            admin::start_admin_server(admin_bind, metrics_admin).await;
        });

        shutdown_token.cancelled().await;
        let _ = worker.await;
        let _ = sweeper.await;
        tracing::info!("Risk engine stopped.");
    });

    Ok(())
}

/// Waits for Ctrl+C or SIGTERM to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => { tracing::info!("Received Ctrl+C"); }
            _ = sigterm.recv() => { tracing::info!("Received SIGTERM"); }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("Failed to listen for Ctrl+C");
    }
}
