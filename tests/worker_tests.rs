//! Integration tests for the clone, update and delete workers over the SQL
//! queue and store, with a scripted mutator standing in for git.

mod test_utils;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use repo_lifecycle::job::{JobKind, JobRecord, LATEST_REVISION};
use repo_lifecycle::mutator::{MutationError, MutationErrorKind};
use repo_lifecycle::queue::JobQueue;
use repo_lifecycle::store::{RepositoryState, RepositoryStateStore, RepositoryStatus};
use repo_lifecycle::worker::JobOutcome;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{FlakyStore, Harness, MutatorCall, repo, test_config};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const URI: &str = "https://github.com/acme/widgets";

fn is_clone(call: &MutatorCall) -> bool {
    matches!(call, MutatorCall::Clone { .. })
}

fn is_update(call: &MutatorCall) -> bool {
    matches!(call, MutatorCall::Update { .. })
}

fn is_delete(call: &MutatorCall) -> bool {
    matches!(call, MutatorCall::Delete { .. })
}

/// A READY record whose last sync is an hour old.
async fn seed_ready(harness: &Harness) -> Result<RepositoryState> {
    let state = RepositoryState::uninitialized(repo(URI))
        .synced("0".repeat(40), Utc::now() - ChronoDuration::hours(1));
    harness.store.put(&state).await?;
    Ok(state)
}

#[tokio::test]
async fn clone_job_brings_repository_to_ready() -> Result<()> {
    let harness = Harness::new().await?;
    harness.lifecycle().clone_uri(URI).await?;

    let registered = harness.store.get(URI).await?.expect("registered");
    assert_eq!(registered.status, RepositoryStatus::Uninitialized);

    let outcome = harness.clone_worker().run_once().await;
    assert_eq!(outcome, Some(JobOutcome::Completed));

    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Ready);
    assert!(state.revision.is_some());
    assert!(state.last_updated_at.is_some());
    assert!(state.active_job_id.is_none());

    assert_eq!(
        harness.mutator.calls(),
        vec![MutatorCall::Clone {
            uri: URI.to_string(),
            revision: LATEST_REVISION.to_string(),
        }]
    );
    assert_eq!(harness.queue.depth(JobKind::Clone).await?, 0);
    Ok(())
}

#[tokio::test]
async fn empty_queue_yields_nothing() -> Result<()> {
    let harness = Harness::new().await?;
    assert_eq!(harness.clone_worker().run_once().await, None);
    assert_eq!(harness.update_worker().run_once().await, None);
    assert_eq!(harness.delete_worker().run_once().await, None);
    Ok(())
}

#[tokio::test]
async fn clone_without_registration_creates_the_record() -> Result<()> {
    let harness = Harness::new().await?;
    harness
        .queue
        .enqueue(JobRecord::clone_job(repo(URI)))
        .await?;

    assert_eq!(
        harness.clone_worker().run_once().await,
        Some(JobOutcome::Completed)
    );
    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn duplicate_clone_requests_clone_once() -> Result<()> {
    let harness = Harness::new().await?;
    let lifecycle = harness.lifecycle();
    lifecycle.clone_uri(URI).await?;
    lifecycle.clone_uri(URI).await?;

    let worker = harness.clone_worker();
    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));
    assert_eq!(worker.run_once().await, Some(JobOutcome::Skipped));

    assert_eq!(harness.mutator.count(is_clone), 1);
    assert_eq!(harness.queue.depth(JobKind::Clone).await?, 0);
    Ok(())
}

#[tokio::test]
async fn update_defers_while_clone_holds_repository() -> Result<()> {
    let harness = Harness::new().await?;
    let cloning = RepositoryState::uninitialized(repo(URI))
        .claimed(RepositoryStatus::Cloning, Uuid::new_v4());
    harness.store.put(&cloning).await?;

    harness
        .queue
        .enqueue(JobRecord::update_job(repo(URI)))
        .await?;

    let worker = harness.update_worker();
    assert_eq!(worker.run_once().await, Some(JobOutcome::Contended));
    assert_eq!(harness.mutator.count(is_update), 0);
    assert_eq!(harness.queue.depth(JobKind::Update).await?, 1);

    // invisible for the contention backoff
    assert_eq!(worker.run_once().await, None);

    // the clone finishes before the update was requested
    let ready = cloning.synced("a".repeat(40), Utc::now() - ChronoDuration::minutes(10));
    assert!(
        harness
            .store
            .compare_and_set(&[RepositoryStatus::Cloning], &ready)
            .await?
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));
    assert_eq!(harness.mutator.count(is_update), 1);

    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Ready);
    Ok(())
}

#[tokio::test]
async fn contention_does_not_count_as_an_attempt() -> Result<()> {
    let harness = Harness::new().await?;
    let updating = RepositoryState::uninitialized(repo(URI))
        .claimed(RepositoryStatus::Updating, Uuid::new_v4());
    harness.store.put(&updating).await?;

    harness
        .queue
        .enqueue(JobRecord::delete_job(repo(URI)))
        .await?;

    let worker = harness.delete_worker();
    assert_eq!(worker.run_once().await, Some(JobOutcome::Contended));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let lease = harness
        .queue
        .lease(JobKind::Delete)
        .await?
        .expect("deferred job comes back");
    assert_eq!(lease.record.attempt, 0);
    Ok(())
}

#[tokio::test]
async fn delete_is_contended_while_update_executes() -> Result<()> {
    let harness = Harness::new().await?;
    seed_ready(&harness).await?;
    harness.mutator.set_delay(Some(Duration::from_millis(300)));

    harness
        .queue
        .enqueue(JobRecord::update_job(repo(URI)))
        .await?;
    let update_worker = harness.update_worker();
    let update = tokio::spawn(async move { update_worker.run_once().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = harness.store.get(URI).await?.expect("state");
        if state.status == RepositoryStatus::Updating {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "update never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    harness.lifecycle().delete_uri(URI).await?;
    let delete_worker = harness.delete_worker();
    assert_eq!(delete_worker.run_once().await, Some(JobOutcome::Contended));
    assert_eq!(harness.mutator.count(is_delete), 0);

    assert_eq!(update.await?, Some(JobOutcome::Completed));

    harness.mutator.set_delay(None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(delete_worker.run_once().await, Some(JobOutcome::Completed));
    assert!(harness.store.get(URI).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn redundant_updates_are_absorbed() -> Result<()> {
    let harness = Harness::new().await?;
    seed_ready(&harness).await?;

    harness
        .queue
        .enqueue(JobRecord::update_job(repo(URI)))
        .await?;
    harness
        .queue
        .enqueue(JobRecord::update_job(repo(URI)))
        .await?;

    let worker = harness.update_worker();
    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));
    assert_eq!(worker.run_once().await, Some(JobOutcome::Skipped));
    assert_eq!(harness.mutator.count(is_update), 1);
    Ok(())
}

#[tokio::test]
async fn update_of_untracked_repository_is_a_no_op() -> Result<()> {
    let harness = Harness::new().await?;
    harness
        .queue
        .enqueue(JobRecord::update_job(repo(URI)))
        .await?;

    assert_eq!(
        harness.update_worker().run_once().await,
        Some(JobOutcome::Skipped)
    );
    assert!(harness.mutator.calls().is_empty());
    assert!(harness.store.get(URI).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn transient_failure_is_retried_by_the_same_job() -> Result<()> {
    let harness = Harness::new().await?;
    seed_ready(&harness).await?;
    harness
        .mutator
        .fail_next(MutationError::transient("connection reset by peer"));

    let job_id = harness
        .queue
        .enqueue(JobRecord::update_job(repo(URI)))
        .await?;

    let worker = harness.update_worker();
    assert_eq!(worker.run_once().await, Some(JobOutcome::Retrying));

    let failed = harness.store.get(URI).await?.expect("state");
    assert_eq!(failed.status, RepositoryStatus::Error);
    assert!(failed.is_owned_by(job_id));
    let info = failed.error_info.expect("error info recorded");
    assert_eq!(info.class, MutationErrorKind::Transient);
    assert_eq!(info.job_kind, JobKind::Update);
    assert_eq!(info.attempt, 0);
    assert_eq!(info.message, "connection reset by peer");

    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));
    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Ready);
    assert!(state.error_info.is_none());
    assert_eq!(harness.mutator.count(is_update), 2);
    Ok(())
}

#[tokio::test]
async fn retry_ceiling_dead_letters_and_operator_can_requeue() -> Result<()> {
    let mut config = test_config();
    config.worker.max_attempts = 1;
    let harness = Harness::with_config(config).await?;
    let lifecycle = harness.lifecycle();

    harness
        .mutator
        .fail_always(Some(MutationError::permanent("repository does not exist")));
    lifecycle.clone_uri(URI).await?;

    let worker = harness.clone_worker();
    assert_eq!(worker.run_once().await, Some(JobOutcome::Retrying));
    assert_eq!(worker.run_once().await, Some(JobOutcome::DeadLettered));
    assert_eq!(worker.run_once().await, None);
    assert_eq!(harness.mutator.count(is_clone), 2);

    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Error);
    let info = state.error_info.expect("error info recorded");
    assert_eq!(info.class, MutationErrorKind::Permanent);
    assert_eq!(info.attempt, 1);

    let dead_letters = lifecycle.dead_letters(10).await?;
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].record.kind(), JobKind::Clone);
    assert_eq!(dead_letters[0].record.attempt, 2);
    assert!(dead_letters[0].reason.contains("repository does not exist"));

    harness.mutator.fail_always(None);
    lifecycle.requeue_dead_letter(dead_letters[0].id).await?;

    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));
    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Ready);
    assert!(lifecycle.dead_letters(10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn slow_mutation_times_out_as_transient_failure() -> Result<()> {
    let mut config = test_config();
    config.worker.mutation_timeout_ms = 50;
    let harness = Harness::with_config(config).await?;

    harness.mutator.set_delay(Some(Duration::from_millis(500)));
    harness.lifecycle().clone_uri(URI).await?;

    assert_eq!(
        harness.clone_worker().run_once().await,
        Some(JobOutcome::Retrying)
    );

    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Error);
    let info = state.error_info.expect("error info recorded");
    assert_eq!(info.class, MutationErrorKind::Transient);
    assert!(info.message.contains("timed out"));
    Ok(())
}

#[tokio::test]
async fn crashed_clone_is_resumed_after_lease_expiry() -> Result<()> {
    let mut config = test_config();
    config.queue.visibility_timeout_ms = 200;
    let harness = Harness::with_config(config).await?;
    harness.lifecycle().clone_uri(URI).await?;

    // a worker leases the job, claims the repository and dies
    let lease = harness
        .queue
        .lease(JobKind::Clone)
        .await?
        .expect("lease");
    let registered = harness.store.get(URI).await?.expect("registered");
    let cloning = registered.claimed(RepositoryStatus::Cloning, lease.job_id);
    assert!(
        harness
            .store
            .compare_and_set(&[RepositoryStatus::Uninitialized], &cloning)
            .await?
    );

    let worker = harness.clone_worker();
    assert_eq!(worker.run_once().await, None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));

    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Ready);
    assert_eq!(harness.mutator.count(is_clone), 1);
    Ok(())
}

#[tokio::test]
async fn brief_store_outage_is_retried_in_place() -> Result<()> {
    let harness = Harness::new().await?;
    let store = Arc::new(FlakyStore::new(harness.store.clone()));
    let worker = harness.clone_worker_with_store(store.clone());
    harness.lifecycle().clone_uri(URI).await?;

    // one failure fits inside the operation retry limit of two
    store.fail_next_calls(1);
    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));
    assert_eq!(store.failed_calls(), 1);

    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Ready);
    assert_eq!(harness.mutator.count(is_clone), 1);
    Ok(())
}

#[tokio::test]
async fn store_outage_leaves_job_for_redelivery() -> Result<()> {
    let mut config = test_config();
    config.queue.visibility_timeout_ms = 200;
    let harness = Harness::with_config(config).await?;
    let store = Arc::new(FlakyStore::new(harness.store.clone()));
    let worker = harness.clone_worker_with_store(store.clone());
    harness.lifecycle().clone_uri(URI).await?;

    store.fail_next_calls(2);
    assert_eq!(worker.run_once().await, Some(JobOutcome::Abandoned));
    assert_eq!(store.failed_calls(), 2);
    assert!(harness.mutator.calls().is_empty());

    // still leased by the abandoned attempt
    assert_eq!(worker.run_once().await, None);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));

    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Ready);
    assert_eq!(harness.mutator.count(is_clone), 1);
    Ok(())
}

#[tokio::test]
async fn failure_is_not_dead_lettered_until_error_is_recorded() -> Result<()> {
    let mut config = test_config();
    config.queue.visibility_timeout_ms = 200;
    config.worker.max_attempts = 0;
    let harness = Harness::with_config(config).await?;
    let store = Arc::new(FlakyStore::new(harness.store.clone()));
    let worker = harness.clone_worker_with_store(store.clone());

    harness
        .mutator
        .fail_always(Some(MutationError::permanent("repository does not exist")));
    store.fail_error_writes(true);
    harness.lifecycle().clone_uri(URI).await?;

    assert_eq!(worker.run_once().await, Some(JobOutcome::Abandoned));
    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Cloning);
    assert!(harness.queue.dead_letters(10).await?.is_empty());
    assert_eq!(worker.run_once().await, None);

    // once the store accepts the write, the redelivered job records ERROR
    store.fail_error_writes(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(worker.run_once().await, Some(JobOutcome::DeadLettered));

    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Error);
    assert_eq!(harness.queue.dead_letters(10).await?.len(), 1);

    // and ERROR is reachable by a delete
    harness.mutator.fail_always(None);
    harness.lifecycle().delete_uri(URI).await?;
    assert_eq!(
        harness.delete_worker().run_once().await,
        Some(JobOutcome::Completed)
    );
    assert!(harness.store.get(URI).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn requeued_update_recovers_repository_from_error() -> Result<()> {
    let mut config = test_config();
    config.worker.max_attempts = 0;
    let harness = Harness::with_config(config).await?;
    let lifecycle = harness.lifecycle();
    let seeded = seed_ready(&harness).await?;

    harness
        .mutator
        .fail_always(Some(MutationError::transient("connection reset by peer")));
    let job_id = harness
        .queue
        .enqueue(JobRecord::update_job(repo(URI)))
        .await?;

    let worker = harness.update_worker();
    assert_eq!(worker.run_once().await, Some(JobOutcome::DeadLettered));
    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Error);
    assert_eq!(state.active_job_id, Some(job_id));

    harness.mutator.fail_always(None);
    let dead_letters = lifecycle.dead_letters(10).await?;
    assert_eq!(dead_letters.len(), 1);
    let requeued = lifecycle.requeue_dead_letter(dead_letters[0].id).await?;
    assert_eq!(requeued, job_id);

    assert_eq!(worker.run_once().await, Some(JobOutcome::Completed));
    let state = harness.store.get(URI).await?.expect("state");
    assert_eq!(state.status, RepositoryStatus::Ready);
    assert_ne!(state.revision, seeded.revision);
    assert!(state.error_info.is_none());
    assert_eq!(harness.mutator.count(is_update), 2);
    Ok(())
}

#[tokio::test]
async fn clone_of_repository_cloned_by_another_job_is_skipped() -> Result<()> {
    let harness = Harness::new().await?;
    let cloning = RepositoryState::uninitialized(repo(URI))
        .claimed(RepositoryStatus::Cloning, Uuid::new_v4());
    harness.store.put(&cloning).await?;

    harness
        .queue
        .enqueue(JobRecord::clone_job(repo(URI)))
        .await?;

    assert_eq!(
        harness.clone_worker().run_once().await,
        Some(JobOutcome::Skipped)
    );
    assert!(harness.mutator.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn delete_removes_content_and_record() -> Result<()> {
    let harness = Harness::new().await?;
    seed_ready(&harness).await?;
    harness.lifecycle().delete_uri(URI).await?;

    assert_eq!(
        harness.delete_worker().run_once().await,
        Some(JobOutcome::Completed)
    );
    assert!(harness.store.get(URI).await?.is_none());
    assert_eq!(harness.mutator.count(is_delete), 1);
    Ok(())
}

#[tokio::test]
async fn delete_of_untracked_repository_is_a_no_op() -> Result<()> {
    let harness = Harness::new().await?;
    harness.lifecycle().delete_uri(URI).await?;

    assert_eq!(
        harness.delete_worker().run_once().await,
        Some(JobOutcome::Skipped)
    );
    assert!(harness.mutator.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn worker_loop_stops_on_shutdown() -> Result<()> {
    let harness = Harness::new().await?;
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(harness.clone_worker().run(shutdown.clone()));

    harness.lifecycle().clone_uri(URI).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = harness.store.get(URI).await?;
        if state.is_some_and(|s| s.status == RepositoryStatus::Ready) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "clone did not complete in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task).await??;
    Ok(())
}
