// formflow orchestrator binary
//
// Wires config -> queue store -> per-portal supervisors -> ingestion watcher,
// schedulers and status API, then waits for ctrl-c and shuts everything down
// in order: watchers and schedulers first, master drivers last.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use formflow::{
    BasicFormFiller, BlobStore, CaptchaSolver, ChromiumProvider, HttpBlobStore, HttpCaptchaSolver,
    IngestionWatcher, JobExecutor, JobStore, LogCriticalHook, MasterRecoverySteps, MasterSession,
    PortalProbes, ProfileStore, RecoveryCoordinator, Scheduler, SqliteDocumentFeed, load_config,
    status_api,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "formflow.toml".to_string());
    let config = load_config(&config_path)?;

    let store = Arc::new(
        JobStore::open(config.queue_db_path())
            .await
            .context("Failed to open queue database")?,
    );

    let solver: Arc<dyn CaptchaSolver> = match config.ocr_endpoint() {
        Some(endpoint) => Arc::new(HttpCaptchaSolver::new(endpoint)),
        None => anyhow::bail!("Config must set ocr_endpoint: portal login requires CAPTCHA OCR"),
    };
    let blobs: Option<Arc<dyn BlobStore>> = config
        .blob_endpoint()
        .map(|endpoint| Arc::new(HttpBlobStore::new(endpoint)) as Arc<dyn BlobStore>);

    let provider = Arc::new(ChromiumProvider::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut routes = HashMap::new();
    let mut coordinators = HashMap::new();
    let mut handles = Vec::new();
    let mut sessions = Vec::new();
    let mut max_attempts = 3;

    for portal_config in config.portals() {
        let portal_config = Arc::new(portal_config.clone());
        let tunables = portal_config.tunables().clone();
        max_attempts = tunables.max_attempts();

        let profiles = Arc::new(
            ProfileStore::new(
                portal_config.clone_root().clone(),
                tunables.clone_file_skip_size(),
            )
            .context("Failed to prepare clone root")?,
        );
        let swept = profiles.sweep_stale_clones()?;
        if swept > 0 {
            info!("Swept {swept} stale clones for portal {}", portal_config.name());
        }

        let probes = Arc::new(PortalProbes::new(
            Arc::clone(&portal_config),
            Arc::clone(&solver),
        ));
        let session = Arc::new(MasterSession::new(
            Arc::clone(&portal_config),
            provider.clone() as Arc<dyn formflow::BrowserProvider>,
            Arc::clone(&probes),
        ));

        // Initial login is fatal: without a master session no job can run
        session
            .initialize()
            .await
            .with_context(|| format!("Master login failed for portal {}", portal_config.name()))?;

        let steps = Arc::new(MasterRecoverySteps::new(
            Arc::clone(&session),
            Arc::clone(&profiles),
        ));
        let recovery = Arc::new(RecoveryCoordinator::new(
            steps,
            &tunables,
            Arc::new(LogCriticalHook),
        ));
        coordinators.insert(portal_config.name().to_string(), Arc::clone(&recovery));

        let form_filler = Arc::new(BasicFormFiller::new(
            "button[type=submit]",
            ".submission-confirmation",
        ));

        let executor = Arc::new(JobExecutor::new(
            Arc::clone(&portal_config),
            Arc::clone(&store),
            profiles,
            provider.clone() as Arc<dyn formflow::BrowserProvider>,
            probes,
            Arc::clone(&session),
            recovery,
            form_filler,
            blobs.clone(),
        ));

        let scheduler = Scheduler::new(
            portal_config.name(),
            Arc::clone(&store),
            executor,
            tunables,
        );
        let scheduler_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = scheduler.run(scheduler_shutdown).await {
                error!("Scheduler failed: {e:#}");
            }
        }));

        routes.insert(portal_config.name().to_string(), Arc::clone(&store));
        sessions.push(session);
    }

    let feed = SqliteDocumentFeed::attach(&store)
        .await
        .context("Failed to attach intake feed")?;
    let watcher = IngestionWatcher::new(
        Box::new(feed),
        routes,
        max_attempts,
        std::time::Duration::from_secs(1),
    );
    let watcher_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(watcher.run(watcher_shutdown)));

    if let Some(addr) = config.status_api_addr() {
        let router = status_api::router(Arc::clone(&store), coordinators);
        let api_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = status_api::serve(addr, router, api_shutdown).await {
                error!("Status API failed: {e:#}");
            }
        }));
    }

    info!("formflow running; press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    // Master drivers go down last so recoveries in flight can finish
    for session in sessions {
        session.shutdown().await;
    }

    info!("Shutdown complete");
    Ok(())
}
