//! # lablinkd: LabLink Receiver Daemon
//!
//! Headless entry point. Wires the ingestion pipeline to the store and
//! the sync engine, then runs until SIGINT/SIGTERM.
//!
//! ```text
//! config ──► Database ──► ListenerSupervisor (one task per port)
//!                │                 │ events
//!                │                 ▼
//!                └────────► SyncEngine ──► external server
//! ```
//!
//! Configuration comes from `LABLINK_CONFIG`, the first CLI argument, or
//! `./lablink.toml`; a commented default file is written on first run.

use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lablink_core::{AppConfig, AppEvent, EventBus};
use lablink_db::{Database, DbConfig};
use lablink_ingest::{IngestContext, ListenerSupervisor};
use lablink_sync::{SyncEngine, SyncEngineHandle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // ---- Configuration ------------------------------------------------------
    let config_path = std::env::var("LABLINK_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1))
        .unwrap_or_else(|| "lablink.toml".to_string());

    let config = AppConfig::load_or_default(&config_path)?;
    info!(
        path = %config_path,
        app = %config.app_name,
        instance = %config.instance_id,
        listeners = config.listener_specs().len(),
        "Configuration loaded"
    );

    // ---- Store --------------------------------------------------------------
    let db = Database::new(DbConfig::new(&config.database_path)).await?;

    // ---- Event bus and observer log ----------------------------------------
    let events = EventBus::new();

    // ---- Sync engine --------------------------------------------------------
    let (sync_engine, sync_handle) = SyncEngine::new(
        db.clone(),
        events.clone(),
        config.external_server.clone(),
        config.instance_id.clone(),
    );
    let sync_task = tokio::spawn(sync_engine.run());

    // The observer task stands in for the UI: it logs every event and
    // pokes the sync engine whenever new results land.
    tokio::spawn(observe_events(events.clone(), sync_handle.clone()));

    // ---- Listeners ----------------------------------------------------------
    let mut supervisor = ListenerSupervisor::new(IngestContext {
        db: db.clone(),
        events: events.clone(),
        idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        app_name: config.app_name.clone(),
    });

    if let Err(e) = supervisor.start(config.listener_specs()).await {
        // Some ports may still be up; keep running with whatever bound.
        error!(error = %e, "Not all listeners started");
        if supervisor.bound_ports().is_empty() {
            return Err(e.into());
        }
    }
    info!(ports = ?supervisor.bound_ports(), "Receiver ready");

    // ---- Run until a shutdown signal ---------------------------------------
    shutdown_signal().await;
    info!("Shutting down");

    supervisor.stop().await;
    sync_handle.shutdown();
    if tokio::time::timeout(Duration::from_secs(30), sync_task)
        .await
        .is_err()
    {
        warn!("Sync engine did not stop within 30s");
    }
    db.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Logs observer events and forwards new-result notifications to the
/// sync engine.
async fn observe_events(events: EventBus, sync: SyncEngineHandle) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(AppEvent::MessageIngested { port, summary }) => {
                info!(
                    port,
                    analyzer = %summary.analyzer,
                    patient = %summary.patient_id,
                    sample = %summary.sample_id,
                    results = summary.result_count,
                    "Message ingested"
                );
                sync.notify_new_results();
            }
            Ok(AppEvent::ListenerStateChanged {
                port,
                state,
                client_count,
            }) => {
                info!(port, ?state, clients = client_count, "Listener state");
            }
            Ok(AppEvent::SyncAttempt {
                outcome,
                attempts,
                results,
                detail,
            }) => {
                info!(?outcome, attempts, results, %detail, "Sync attempt");
            }
            Ok(AppEvent::Warning { kind, detail }) => {
                warn!(%kind, %detail, "Warning");
            }
            Ok(AppEvent::Error { kind, detail }) => {
                error!(%kind, %detail, "Error");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Observer lagged, events dropped");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
