//! formflow: browser-automation job orchestrator
//!
//! Drives a vendor web portal (insurance policy form submission) for records
//! ingested from a document store. A master browser session is kept logged
//! in at process scope; each job runs in its own browser against a clone of
//! the master's authenticated profile, with a three-level self-healing
//! recovery protocol behind a single-flight gate and a failure-class-aware
//! retry state machine that never repeats a submission the portal already
//! accepted.

pub mod collaborators;
pub mod config;
pub mod driver;
pub mod error;
pub mod ingest;
pub mod job_queue;
pub mod portal;
pub mod profile_store;
pub mod recovery;
pub mod scheduler;
pub mod session;
pub mod status_api;

pub use collaborators::{BlobStore, CaptchaSolver, HttpBlobStore, HttpCaptchaSolver};
pub use config::{
    OrchestratorConfig, PortalConfig, PortalConfigBuilder, PortalSelectors, Tunables, load_config,
};
pub use driver::{BrowserProvider, ChromiumDriver, ChromiumProvider, Driver, LaunchOptions};
pub use error::{DriverError, FailureStage, JobError, ProfileError, StoreError};
pub use ingest::{DocumentFeed, IngestionWatcher, SourceDocument, SqliteDocumentFeed};
pub use job_queue::{ErrorRecord, Job, JobStatus, JobStore, StatusCounts};
pub use portal::{BasicFormFiller, CloneValidation, FormFiller, FormOutcome, PortalProbes};
pub use profile_store::{CloneLayout, CloneLease, ProfileStore};
pub use recovery::{
    CriticalHook, HistoryEntry, LogCriticalHook, RecoveryCoordinator, RecoveryLevel,
    RecoveryOutcome, RecoverySteps,
};
pub use scheduler::{JobExecutor, Scheduler};
pub use session::{MasterRecoverySteps, MasterSession};
