//! Queue store round-trips, transition legality and crash recovery

use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use formflow::{ErrorRecord, FailureStage, JobStatus, JobStore, StoreError};

fn record(attempt: u32, stage: FailureStage, message: &str) -> ErrorRecord {
    ErrorRecord {
        timestamp: Utc::now(),
        attempt_number: attempt,
        message: message.to_string(),
        kind: "pre_submission".to_string(),
        stage,
        screenshot_ref: None,
    }
}

async fn open_store(dir: &TempDir) -> JobStore {
    JobStore::open(&dir.path().join("queue.sqlite"))
        .await
        .expect("open store")
}

#[tokio::test]
async fn enqueue_then_query_round_trips_payload() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;

    let payload = serde_json::json!({"policy": "MH-1234", "holder": "A. Driver"});
    let id = store
        .enqueue("acme", "doc-1", &payload, 3)
        .await
        .expect("enqueue");

    let job = store
        .get_by_correlation("doc-1")
        .await
        .expect("query")
        .expect("job exists");
    assert_eq!(job.id, id);
    assert_eq!(job.form_data, payload);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert!(job.error_log.is_empty());
    assert!(job.started_at.is_none());
}

#[tokio::test]
async fn duplicate_correlation_key_is_a_no_op() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;

    let first = store
        .enqueue("acme", "doc-1", &serde_json::json!({"v": 1}), 3)
        .await
        .expect("first enqueue");
    let second = store
        .enqueue("acme", "doc-1", &serde_json::json!({"v": 2}), 3)
        .await
        .expect("second enqueue");

    assert_eq!(first, second);
    let job = store
        .get_by_correlation("doc-1")
        .await
        .expect("query")
        .expect("job");
    // The original payload survives
    assert_eq!(job.form_data, serde_json::json!({"v": 1}));
}

#[tokio::test]
async fn claim_marks_processing_and_increments_attempts() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    store
        .enqueue("acme", "doc-1", &serde_json::json!({}), 3)
        .await
        .expect("enqueue");

    let job = store.claim_next("acme").await.expect("claim").expect("job");
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempts, 1);
    assert!(job.started_at.is_some());
    assert!(job.last_attempt_at.is_some());

    // Queue is now empty for this portal
    assert!(store.claim_next("acme").await.expect("claim").is_none());
    // And was never visible to another portal
    assert!(store.claim_next("other").await.expect("claim").is_none());
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_the_same_job() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    for i in 0..4 {
        store
            .enqueue("acme", &format!("doc-{i}"), &serde_json::json!({}), 3)
            .await
            .expect("enqueue");
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(
            async move { store.claim_next("acme").await },
        ));
    }

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.expect("join").expect("claim") {
            claimed.push(job.id);
        }
    }

    claimed.sort();
    let before = claimed.len();
    claimed.dedup();
    assert_eq!(before, claimed.len(), "a job was claimed twice");
    assert_eq!(claimed.len(), 4);
}

#[tokio::test]
async fn complete_is_terminal_and_stamped() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    store
        .enqueue("acme", "doc-1", &serde_json::json!({}), 3)
        .await
        .expect("enqueue");
    let job = store.claim_next("acme").await.expect("claim").expect("job");

    store.complete(&job.id).await.expect("complete");

    let done = store.get(&job.id).await.expect("get").expect("job");
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.completed_at.is_some());
    assert!(done.attempts >= 1);

    // No further transitions
    let err = store.complete(&job.id).await.expect_err("double complete");
    assert!(matches!(err, StoreError::IllegalTransition { .. }));
    let err = store
        .fail(&job.id, record(1, FailureStage::PreSubmission, "late"), Duration::ZERO)
        .await
        .expect_err("fail after complete");
    assert!(matches!(err, StoreError::IllegalTransition { .. }));
}

#[tokio::test]
async fn pre_submission_failure_requeues_with_backoff() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    store
        .enqueue("acme", "doc-1", &serde_json::json!({}), 3)
        .await
        .expect("enqueue");
    let job = store.claim_next("acme").await.expect("claim").expect("job");

    let before = Utc::now();
    let status = store
        .fail(
            &job.id,
            record(1, FailureStage::PreSubmission, "portal 500"),
            Duration::from_secs(60),
        )
        .await
        .expect("fail");
    assert_eq!(status, JobStatus::Pending);

    let requeued = store.get(&job.id).await.expect("get").expect("job");
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.attempts, 1);
    assert_eq!(requeued.error_log.len(), 1);
    assert_eq!(requeued.last_error.as_deref(), Some("portal 500"));
    assert!(requeued.final_error.is_none());

    let retry_at = requeued.next_retry_at.expect("next_retry_at set");
    let delta = (retry_at - before).num_seconds();
    assert!((59..=62).contains(&delta), "next_retry_at ~= now + 60s, got {delta}s");

    // Not claimable until the backoff elapses
    assert!(store.claim_next("acme").await.expect("claim").is_none());
}

#[tokio::test]
async fn pre_submission_exhaustion_is_terminal_at_max_attempts() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    store
        .enqueue("acme", "doc-1", &serde_json::json!({}), 3)
        .await
        .expect("enqueue");

    for attempt in 1..=3u32 {
        let job = store.claim_next("acme").await.expect("claim").expect("job");
        assert_eq!(job.attempts, attempt);
        let status = store
            .fail(
                &job.id,
                record(attempt, FailureStage::PreSubmission, "portal 500"),
                Duration::ZERO,
            )
            .await
            .expect("fail");
        if attempt < 3 {
            assert_eq!(status, JobStatus::Pending);
        } else {
            assert_eq!(status, JobStatus::FailedPreSubmission);
        }
    }

    let dead = store
        .get_by_correlation("doc-1")
        .await
        .expect("get")
        .expect("job");
    assert_eq!(dead.status, JobStatus::FailedPreSubmission);
    assert_eq!(dead.attempts, 3);
    assert_eq!(dead.error_log.len(), 3);
    assert!(dead.failed_at.is_some());
    assert!(dead.final_error.is_some());

    // attempt numbers strictly increase
    let numbers: Vec<u32> = dead.error_log.iter().map(|r| r.attempt_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);

    assert!(store.claim_next("acme").await.expect("claim").is_none());
}

#[tokio::test]
async fn post_submission_failure_is_terminal_on_first_attempt() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    store
        .enqueue("acme", "doc-1", &serde_json::json!({}), 3)
        .await
        .expect("enqueue");
    let job = store.claim_next("acme").await.expect("claim").expect("job");

    let status = store
        .fail(
            &job.id,
            ErrorRecord {
                timestamp: Utc::now(),
                attempt_number: 1,
                message: "confirmation page crashed".to_string(),
                kind: "post_submission".to_string(),
                stage: FailureStage::PostSubmission,
                screenshot_ref: Some("https://blobs.test/shot.png".to_string()),
            },
            Duration::from_secs(60),
        )
        .await
        .expect("fail");
    assert_eq!(status, JobStatus::FailedPostSubmission);

    let dead = store.get(&job.id).await.expect("get").expect("job");
    assert_eq!(dead.status, JobStatus::FailedPostSubmission);
    assert_eq!(dead.attempts, 1);
    assert_eq!(dead.error_log.len(), 1);
    assert_eq!(dead.error_log[0].stage, FailureStage::PostSubmission);
    assert_eq!(
        dead.error_log[0].screenshot_ref.as_deref(),
        Some("https://blobs.test/shot.png")
    );

    // Never claimable again, whatever the backoff
    assert!(store.claim_next("acme").await.expect("claim").is_none());

    // A duplicate enqueue for the same document is a no-op
    store
        .enqueue("acme", "doc-1", &serde_json::json!({}), 3)
        .await
        .expect("re-enqueue");
    assert!(store.claim_next("acme").await.expect("claim").is_none());
}

#[tokio::test]
async fn recover_stuck_resets_processing_jobs() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    store
        .enqueue("acme", "doc-1", &serde_json::json!({}), 3)
        .await
        .expect("enqueue");
    let job = store.claim_next("acme").await.expect("claim").expect("job");

    // Simulated crash: the process dies with the job processing
    let reset = store.recover_stuck(Duration::ZERO).await.expect("recover");
    assert_eq!(reset, 1);

    let revived = store.get(&job.id).await.expect("get").expect("job");
    assert_eq!(revived.status, JobStatus::Pending);
    // Attempts preserved, not reset
    assert_eq!(revived.attempts, 1);
    assert!(revived.next_retry_at.is_none());

    // Claimable again immediately
    let again = store.claim_next("acme").await.expect("claim").expect("job");
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts, 2);
}

#[tokio::test]
async fn recover_stuck_terminates_jobs_with_spent_budget() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    store
        .enqueue("acme", "doc-1", &serde_json::json!({}), 1)
        .await
        .expect("enqueue");
    // One claim spends the whole budget, then the process "crashes"
    store.claim_next("acme").await.expect("claim").expect("job");

    let reset = store.recover_stuck(Duration::ZERO).await.expect("recover");
    assert_eq!(reset, 1);

    let dead = store
        .get_by_correlation("doc-1")
        .await
        .expect("get")
        .expect("job");
    assert_eq!(dead.status, JobStatus::FailedPreSubmission);
    assert_eq!(dead.error_log.len(), 1);
    assert_eq!(dead.error_log[0].kind, "stuck");
}

#[tokio::test]
async fn recover_stuck_respects_max_age() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    store
        .enqueue("acme", "doc-1", &serde_json::json!({}), 3)
        .await
        .expect("enqueue");
    store.claim_next("acme").await.expect("claim").expect("job");

    // The job just started; a one-hour age gate must leave it alone
    let reset = store
        .recover_stuck(Duration::from_secs(3600))
        .await
        .expect("recover");
    assert_eq!(reset, 0);

    let job = store
        .get_by_correlation("doc-1")
        .await
        .expect("get")
        .expect("job");
    assert_eq!(job.status, JobStatus::Processing);
}

#[tokio::test]
async fn listings_and_counts_reflect_status() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;

    for i in 0..3 {
        store
            .enqueue("acme", &format!("doc-{i}"), &serde_json::json!({}), 3)
            .await
            .expect("enqueue");
    }
    let job = store.claim_next("acme").await.expect("claim").expect("job");
    store.complete(&job.id).await.expect("complete");

    let counts = store.counts_by_status().await.expect("counts");
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.processing, 0);

    let pending = store
        .list_by_status(JobStatus::Pending, 0, 10)
        .await
        .expect("list");
    assert_eq!(pending.len(), 2);

    let page_one = store
        .list_by_status(JobStatus::Pending, 0, 1)
        .await
        .expect("list");
    let page_two = store
        .list_by_status(JobStatus::Pending, 1, 1)
        .await
        .expect("list");
    assert_eq!(page_one.len(), 1);
    assert_eq!(page_two.len(), 1);
    assert_ne!(page_one[0].id, page_two[0].id);
}
