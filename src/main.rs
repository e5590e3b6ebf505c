use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use request_guard::audit::{AlertError, AuditRecord, FnAlert, Severity};
use request_guard::clock::SystemClock;
use request_guard::config::LogFormat;
use request_guard::state::rate_limit_store;
use request_guard::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Configuration is read before logging so LOG_FORMAT can take effect
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LogFormat::Pretty, "info");
            error!("Configuration error: {e}");
            return ExitCode::from(exitcode::CONFIG as u8);
        }
    };
    init_tracing(config.log_format, &config.log_level);

    info!(
        "Starting Request Guard v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run(config).await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

fn init_tracing(format: LogFormat, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Run the application, returning an exit code on error.
async fn run(config: Config) -> Result<(), exitcode::ExitCode> {
    info!(
        host = %config.host,
        port = %config.port,
        environment = %config.environment,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    }

    let store = rate_limit_store(&config).await.map_err(|e| {
        error!("Failed to initialize rate limit store: {e}");
        exitcode::UNAVAILABLE
    })?;

    let state = AppState::new(config.clone(), SystemClock::shared(), store).map_err(|e| {
        error!("Failed to build application state: {e}");
        exitcode::SOFTWARE
    })?;

    // Critical records are surfaced on a dedicated target for log-based paging
    state.audit.register_alert_callback(Arc::new(FnAlert::new(
        "log-alert",
        |record: Arc<AuditRecord>| async move {
            if record.severity == Severity::Critical {
                error!(
                    target: "alert",
                    id = %record.id,
                    event = record.event.as_str(),
                    actor = %record.actor,
                    "Critical security event"
                );
            }
            Ok::<(), AlertError>(())
        },
    )));

    let app = build_router(state.clone());

    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET    /health            - Health check");
    info!("  GET    /ready             - Readiness check");
    info!("  GET    /api/csrf          - Issue CSRF token");
    info!("  DELETE /api/csrf          - Rotate CSRF token");
    info!("  GET    /api/audit/recent  - Recent audit records");
    info!("  GET    /api/posts         - List posts");
    info!("  POST   /api/posts         - Create post");

    // Peer addresses feed client IP resolution
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(utils::shutdown_signal())
    .await
    .map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;

    info!("HTTP server stopped, shutting down background tasks...");
    state.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
