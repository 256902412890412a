use std::sync::Arc;

use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use convert_fleet::Result;
use convert_fleet::admission::AdmissionController;
use convert_fleet::api::api_routes;
use convert_fleet::config::ControlPlaneConfig;
use convert_fleet::lock::{DistributedLock, StoreLock};
use convert_fleet::monitor::{FleetHealthMonitor, spawn_monitor_ticker};
use convert_fleet::notify::{BroadcastNotifier, Notifier};
use convert_fleet::provision::{LocalProcessProvisioner, Provisioner, WorkerSpec};
use convert_fleet::quota::{QuotaLedger, StoreQuotaLedger};
use convert_fleet::scheduler::{self, SchedulerState};
use convert_fleet::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = ControlPlaneConfig::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "convert-fleet.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    };

    run(config).await?;
    Ok(())
}

async fn run(config: ControlPlaneConfig) -> Result<()> {
    eprintln!("🛠  Convert Fleet v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/jobs", config.http_port);
    eprintln!("   Worker: {} ({})", config.worker.program, config.worker.formats);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Core collaborators ──────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = Arc::new(BroadcastNotifier::new());
    let ledger: Arc<dyn QuotaLedger> = Arc::new(StoreQuotaLedger::new(Arc::clone(&db)));
    let lock: Arc<dyn DistributedLock> = Arc::new(StoreLock::new(Arc::clone(&db)));
    let scheduler = Arc::new(SchedulerState::new(
        Arc::clone(&db),
        Arc::clone(&ledger),
        Arc::clone(&notifier),
        config.admission.job_cost,
    ));

    // ── Startup recovery ────────────────────────────────────────────────
    let requeued = scheduler.recover().await?;
    if requeued > 0 {
        eprintln!("   Recovered {requeued} queued jobs from DB");
    }

    // ── Fleet ───────────────────────────────────────────────────────────
    let spec = WorkerSpec::from_config(&config.worker)?;
    let provisioner: Arc<dyn Provisioner> =
        Arc::new(LocalProcessProvisioner::new(config.monitor.probe_deadline));
    let monitor = Arc::new(FleetHealthMonitor::new(
        Arc::clone(&scheduler),
        provisioner,
        Arc::clone(&notifier),
        config.monitor.clone(),
        spec,
    ));
    let started = monitor.provision(config.monitor.min_workers).await;
    eprintln!(
        "   Workers: {} started (min {}, max {})",
        started.len(),
        config.monitor.min_workers,
        config.monitor.max_workers
    );

    let _monitor_handle = spawn_monitor_ticker(Arc::clone(&monitor), config.monitor.tick_interval);
    let _dispatch_handle =
        scheduler::spawn_dispatch_ticker(Arc::clone(&scheduler), config.dispatch_interval);

    // ── HTTP ────────────────────────────────────────────────────────────
    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&scheduler),
        lock,
        ledger,
        notifier,
        config.admission.clone(),
    ));
    let app = api_routes(Arc::clone(&scheduler), admission).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port)).await?;
    tracing::info!(port = config.http_port, "HTTP server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── Shutdown ────────────────────────────────────────────────────────
    tracing::info!("Server stopped, shutting down workers");
    monitor.shutdown_all().await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
