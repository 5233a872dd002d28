//! Read-only status surface over the job queue
//!
//! Lookup by correlation key, listing by status with pagination, and
//! aggregate counts plus the recovery attempt window. Strictly read-only:
//! nothing here can mutate queue state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::job_queue::{Job, JobStatus, JobStore, StatusCounts};
use crate::recovery::{HistoryEntry, RecoveryCoordinator};

#[derive(Clone)]
struct ApiState {
    store: Arc<JobStore>,
    recovery: Arc<HashMap<String, Arc<RecoveryCoordinator>>>,
}

/// Build the status router over one queue store and the per-portal recovery
/// coordinators.
pub fn router(
    store: Arc<JobStore>,
    recovery: HashMap<String, Arc<RecoveryCoordinator>>,
) -> Router {
    let state = ApiState {
        store,
        recovery: Arc::new(recovery),
    };
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:correlation_key", get(get_job))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve the router until the shutdown signal flips.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_with_listener(listener, router, shutdown).await
}

/// Serve on a pre-bound listener; used by tests binding an ephemeral port.
pub async fn serve_with_listener(
    listener: tokio::net::TcpListener,
    router: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("Status API listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("Status API stopped");
    Ok(())
}

async fn get_job(
    State(state): State<ApiState>,
    Path(correlation_key): Path<String>,
) -> Result<Json<Job>, (StatusCode, String)> {
    match state.store.get_by_correlation(&correlation_key).await {
        Ok(Some(job)) => Ok(Json(job)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            format!("no job for correlation key {correlation_key}"),
        )),
        Err(e) => {
            warn!("Status lookup failed: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

#[derive(Deserialize)]
struct ListParams {
    status: String,
    #[serde(default)]
    page: u32,
    #[serde(default = "default_per_page")]
    per_page: u32,
}

fn default_per_page() -> u32 {
    50
}

#[derive(Serialize)]
struct JobPage {
    page: u32,
    per_page: u32,
    jobs: Vec<Job>,
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<JobPage>, (StatusCode, String)> {
    let Some(status) = JobStatus::parse(&params.status) else {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unknown status `{}`", params.status),
        ));
    };

    match state
        .store
        .list_by_status(status, params.page, params.per_page)
        .await
    {
        Ok(jobs) => Ok(Json(JobPage {
            page: params.page,
            per_page: params.per_page,
            jobs,
        })),
        Err(e) => {
            warn!("Status listing failed: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

#[derive(Serialize)]
struct Stats {
    counts: StatusCounts,
    recovery: HashMap<String, Vec<HistoryEntry>>,
}

async fn stats(
    State(state): State<ApiState>,
) -> Result<Json<Stats>, (StatusCode, String)> {
    let counts = state.store.counts_by_status().await.map_err(|e| {
        warn!("Status counts failed: {e}");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let recovery = state
        .recovery
        .iter()
        .map(|(portal, coordinator)| (portal.clone(), coordinator.history()))
        .collect();

    Ok(Json(Stats { counts, recovery }))
}
