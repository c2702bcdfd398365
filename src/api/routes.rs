//! HTTP routes and server wiring.

use std::sync::Arc;

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::delivery::HttpEventDelivery;
use crate::evidence::{EvidenceCapture, FrameRedactor, HttpRedactor};
use crate::heartbeat::HeartbeatReconciler;
use crate::jobs::JobRegistry;
use crate::ledger::{HttpLedger, Ledger, LocalLedger};
use crate::maintenance::Maintenance;
use crate::monitor::{HttpMonitorClient, MonitorService};
use crate::orchestrator::Orchestrator;
use crate::settlement::Settlement;
use crate::store::{create_task_store, TaskStore};
use crate::webhooks::IdempotencyTracker;

use super::tasks;
use super::types::HealthResponse;
use super::webhooks;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
    /// Seen webhook deliveries
    pub tracker: Arc<IdempotencyTracker>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/webhooks/monitor", post(webhooks::receive_monitor_webhook))
        .route("/api/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route("/api/tasks/:id", get(tasks::get_task))
        .route("/api/tasks/:id/claim", post(tasks::claim_task))
        .route("/api/tasks/:id/start", post(tasks::start_task))
        .route("/api/tasks/:id/stop", post(tasks::stop_task))
        .route("/api/tasks/:id/events", get(tasks::task_events))
        .route("/api/tasks/:id/checkpoints", get(tasks::task_checkpoints))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build every component from `config`, start the background loops and serve.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn TaskStore> = Arc::from(
        create_task_store(config.store.store_type, config.store.database_path.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open task store: {}", e))?,
    );
    tracing::info!(store = ?config.store.store_type, "Task store ready");

    let monitor: Arc<dyn MonitorService> = Arc::new(HttpMonitorClient::new(
        &config.monitor.base_url,
        config.monitor.api_key.clone(),
    ));
    if config.monitor.api_key.is_empty() {
        tracing::warn!("MONITOR_API_KEY not set; monitoring requests are unauthenticated");
    }
    if !config.monitor.verifies_signatures() {
        tracing::warn!(
            "MONITOR_WEBHOOK_SECRET not set; inbound webhooks are accepted without signature checks"
        );
    }

    let ledger: Arc<dyn Ledger> = match &config.ledger.url {
        Some(url) => {
            tracing::info!(url = %url, "Using remote ledger");
            Arc::new(HttpLedger::new(url, config.ledger.api_key.clone()))
        }
        None => {
            tracing::info!("LEDGER_URL not set; using local ledger");
            Arc::new(LocalLedger::new())
        }
    };

    let redactor = config
        .redaction
        .service_url
        .as_deref()
        .map(|url| Arc::new(HttpRedactor::new(url)) as Arc<dyn FrameRedactor>);
    let evidence = EvidenceCapture::new(
        redactor,
        config.redaction.enabled,
        config.redaction.fail_closed,
    );

    let jobs = JobRegistry::new(Arc::clone(&store), Arc::clone(&monitor), config.job_settings());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        jobs,
        Arc::new(HttpEventDelivery::new(config.delivery_timeout)),
        Settlement::new(ledger, config.settlement_policy()),
        evidence,
        config.orchestrator_settings(),
    ));

    let tracker = Arc::new(IdempotencyTracker::new(config.webhooks.idempotency_ttl));
    Arc::clone(&tracker).start_cleanup_task(config.webhooks.cleanup_interval);
    Arc::new(HeartbeatReconciler::new(Arc::clone(&orchestrator), monitor))
        .spawn(config.heartbeat_interval);
    Arc::new(Maintenance::new(
        Arc::clone(&orchestrator),
        config.retention.frame_retention,
    ))
    .spawn(config.retention.maintenance_interval);

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState {
        config,
        orchestrator,
        tracker,
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    // Running jobs are left alone; the heartbeat picks them up after restart.
    tracing::info!("Shutdown signal received");
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let running_jobs = match state.orchestrator.jobs().count_running().await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not count jobs");
            0
        }
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        running_jobs,
        max_concurrent_jobs: state.config.jobs.max_concurrent_jobs,
        webhook_signatures: state.config.monitor.verifies_signatures(),
    })
}
