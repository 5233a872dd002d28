//! Change-feed ingestion into the job queue
//!
//! Watches the upstream document collection and enqueues one job per new
//! document, routed by the payload's `company` discriminator. Delivery is
//! at-least-once; the queue's unique correlation key collapses duplicates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::Row;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::job_queue::JobStore;

/// Reconnect backoff bounds for a broken feed
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// One upstream document as consumed by the watcher
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Upstream document id; becomes the job's correlation key
    pub correlation_key: String,
    /// Discriminator routing the document to a portal instance
    pub company: String,
    /// Opaque form payload
    pub form_data: serde_json::Value,
}

/// Change feed over the upstream collection.
///
/// `poll` returns the documents that appeared since the previous call,
/// possibly empty. Errors indicate a broken subscription; the watcher
/// reconnects with bounded backoff.
#[async_trait]
pub trait DocumentFeed: Send + Sync {
    async fn poll(&mut self) -> anyhow::Result<Vec<SourceDocument>>;
}

// =============================================================================
// SQLite-backed feed
// =============================================================================

/// Rowid-cursor change feed over an `intake` table.
///
/// The cursor starts at the current tail so only documents inserted after
/// process start are consumed; older documents already became jobs in a
/// previous run.
pub struct SqliteDocumentFeed {
    pool: sqlx::SqlitePool,
    cursor: i64,
    initialized: bool,
}

/// Schema of the intake table this feed subscribes to
const INTAKE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS intake (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_key TEXT NOT NULL,
    company TEXT NOT NULL,
    form_data TEXT NOT NULL,
    received_at INTEGER NOT NULL
);
"#;

impl SqliteDocumentFeed {
    /// Attach to the intake table in the queue store's database.
    pub async fn attach(store: &JobStore) -> anyhow::Result<Self> {
        let pool = store.pool().clone();
        sqlx::query(INTAKE_SCHEMA_SQL).execute(&pool).await?;
        Ok(Self {
            pool,
            cursor: 0,
            initialized: false,
        })
    }

    /// Start consuming from the beginning of the table instead of the tail.
    #[must_use]
    pub fn from_start(mut self) -> Self {
        self.initialized = true;
        self.cursor = 0;
        self
    }
}

#[async_trait]
impl DocumentFeed for SqliteDocumentFeed {
    async fn poll(&mut self) -> anyhow::Result<Vec<SourceDocument>> {
        if !self.initialized {
            let tail: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(id), 0) FROM intake")
                .fetch_one(&self.pool)
                .await?;
            self.cursor = tail.0;
            self.initialized = true;
            debug!("Intake feed starting at cursor {}", self.cursor);
        }

        let rows = sqlx::query(
            "SELECT id, correlation_key, company, form_data FROM intake \
             WHERE id > ? ORDER BY id ASC LIMIT 64",
        )
        .bind(self.cursor)
        .fetch_all(&self.pool)
        .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let form_raw: String = row.try_get("form_data")?;
            let form_data = serde_json::from_str(&form_raw)
                .unwrap_or_else(|_| serde_json::Value::String(form_raw.clone()));
            documents.push(SourceDocument {
                correlation_key: row.try_get("correlation_key")?,
                company: row.try_get("company")?,
                form_data,
            });
            self.cursor = id;
        }
        Ok(documents)
    }
}

// =============================================================================
// IngestionWatcher
// =============================================================================

/// Long-lived task pumping the change feed into per-portal queues
pub struct IngestionWatcher {
    feed: Box<dyn DocumentFeed>,
    /// Discriminator value -> queue for that portal
    routes: HashMap<String, Arc<JobStore>>,
    max_attempts: u32,
    poll_interval: Duration,
}

impl IngestionWatcher {
    pub fn new(
        feed: Box<dyn DocumentFeed>,
        routes: HashMap<String, Arc<JobStore>>,
        max_attempts: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            feed,
            routes,
            max_attempts,
            poll_interval,
        }
    }

    /// Run until the shutdown signal flips.
    ///
    /// Feed errors never kill the watcher: the subscription is re-polled
    /// after an exponential backoff with jitter, capped at one minute.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Ingestion watcher started, routing {} discriminators",
            self.routes.len()
        );
        let mut consecutive_failures = 0u32;

        loop {
            let wait = match self.feed.poll().await {
                Ok(documents) => {
                    consecutive_failures = 0;
                    for document in documents {
                        self.dispatch(&document).await;
                    }
                    self.poll_interval
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let backoff = reconnect_backoff(consecutive_failures);
                    warn!(
                        "Change feed error (failure {consecutive_failures}), \
                         reconnecting in {backoff:?}: {e:#}"
                    );
                    backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Ingestion watcher stopped");
    }

    async fn dispatch(&self, document: &SourceDocument) {
        let Some(store) = self.routes.get(&document.company) else {
            warn!(
                "No portal configured for discriminator `{}`, dropping document {}",
                document.company, document.correlation_key
            );
            return;
        };

        match store
            .enqueue(
                &document.company,
                &document.correlation_key,
                &document.form_data,
                self.max_attempts,
            )
            .await
        {
            Ok(job_id) => debug!(
                "Enqueued document {} as job {job_id}",
                document.correlation_key
            ),
            Err(e) => warn!(
                "Failed to enqueue document {}: {e}",
                document.correlation_key
            ),
        }
    }
}

/// Exponential backoff with ±20% jitter, capped at [`BACKOFF_MAX`]
fn reconnect_backoff(consecutive_failures: u32) -> Duration {
    const JITTER_PERCENT: f64 = 0.2;

    let shift = consecutive_failures.saturating_sub(1).min(6);
    let exp_ms = (BACKOFF_BASE.as_millis() as u64).saturating_mul(1 << shift);

    let jitter = rand::rng().random_range(-JITTER_PERCENT..=JITTER_PERCENT);
    let jittered_ms = (exp_ms as f64 * (1.0 + jitter)) as u64;

    Duration::from_millis(jittered_ms.min(BACKOFF_MAX.as_millis() as u64))
}
