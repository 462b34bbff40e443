//! Worker loop tests over the in-memory stream and read model.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use distribution_projector_contracts::{ContractValidator, SchemaResolver};
use distribution_projector_core::{
    AcceptedVersions, BlockProjection, ProjectionPolicy, ReadCursor, StreamConsumer, StreamError,
};
use distribution_projector_runtime::{
    DeadLetterReason, MessageOutcome, ProjectionWorker, RetryPolicy, RunSummary, WorkerConfig,
    WorkerError,
};
use distribution_projector_testing::read_model::Operation;
use distribution_projector_testing::{
    EnvelopeBuilder, FixedClock, InMemoryReadModelStore, InMemoryStream, test_clock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

type TestWorker = ProjectionWorker<InMemoryStream, InMemoryReadModelStore, FixedClock>;

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        batch_size: 10,
        block: Duration::from_millis(5),
        first_block: Duration::from_millis(1),
        read_retry: RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build(),
    }
}

fn worker_with(
    stream: &InMemoryStream,
    store: &InMemoryReadModelStore,
    policy: ProjectionPolicy,
    config: WorkerConfig,
) -> (TestWorker, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let validator = Arc::new(ContractValidator::new(Arc::new(SchemaResolver::bundled_only())));
    let worker = ProjectionWorker::new(
        stream.clone(),
        store.clone(),
        BlockProjection::with_clock(policy, test_clock()),
        validator,
        config,
        shutdown_rx,
    );
    (worker, shutdown_tx)
}

fn worker(stream: &InMemoryStream, store: &InMemoryReadModelStore) -> (TestWorker, watch::Sender<bool>) {
    worker_with(stream, store, ProjectionPolicy::default(), fast_config())
}

#[tokio::test]
async fn test_projects_and_acknowledges() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    let id = stream.publish(EnvelopeBuilder::block_ready_v2("e-ok", "b-1", &["o-1"]).to_json());
    let (mut worker, _shutdown) = worker(&stream, &store);

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(summary.projected, 1);
    assert_eq!(summary.total(), 1);
    assert_eq!(stream.acknowledged(), vec![id]);
    assert!(stream.pending_ids().is_empty());
    assert!(stream.dead_letters().is_empty());
    assert_eq!(store.snapshot().linked_orders("b-1"), vec!["o-1"]);
    assert_eq!(store.commits(), 1);
}

#[tokio::test]
async fn test_process_message_reports_projection() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    let id = stream.publish(EnvelopeBuilder::block_ready_v2("e-ok", "b-1", &["o-1"]).to_json());
    let mut reader = stream.clone();
    let batch = reader.read(ReadCursor::New, 10, Duration::ZERO).await.unwrap();
    let (mut worker, _shutdown) = worker(&stream, &store);

    let outcome = worker.process_message(&batch[0]).await.expect("process");

    assert_eq!(
        outcome,
        MessageOutcome::Projected {
            event_id: "e-ok".into(),
            block_id: "b-1".into(),
            linked: 1,
            missing: 0,
        }
    );
    assert_eq!(stream.acknowledged(), vec![id]);
}

#[tokio::test]
async fn test_replayed_event_is_duplicate_and_acknowledged() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    let envelope = EnvelopeBuilder::block_ready_v2("e-ok", "b-1", &["o-1"]).to_json();
    stream.publish(envelope.clone());
    stream.publish(envelope);
    let (mut worker, _shutdown) = worker(&stream, &store);

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(
        summary,
        RunSummary {
            projected: 1,
            duplicates: 1,
            skipped: 0,
            dead_lettered: 0,
        }
    );
    assert_eq!(stream.acknowledged().len(), 2);
    assert_eq!(store.snapshot().links.len(), 1);
}

#[tokio::test]
async fn test_entry_without_payload_is_skipped() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    let id = stream.publish_without_payload();
    let (mut worker, _shutdown) = worker(&stream, &store);

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(summary.skipped, 1);
    assert_eq!(stream.acknowledged(), vec![id]);
    assert!(stream.dead_letters().is_empty());
    assert!(store.operations().is_empty());
}

#[tokio::test]
async fn test_blank_payload_is_skipped_not_dead_lettered() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    let empty = stream.publish("");
    let blank = stream.publish("  \n");
    let (mut worker, _shutdown) = worker(&stream, &store);

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.dead_lettered, 0);
    assert_eq!(stream.acknowledged(), vec![empty, blank]);
    assert!(stream.dead_letters().is_empty());
    assert!(store.operations().is_empty());
}

#[tokio::test]
async fn test_invalid_json_is_dead_lettered() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    let id = stream.publish("{not json");
    let (mut worker, _shutdown) = worker(&stream, &store);

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(summary.dead_lettered, 1);
    let parked = stream.dead_letters();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].data, "{not json");
    assert!(parked[0].error.starts_with("json:"), "got {}", parked[0].error);
    assert_eq!(stream.acknowledged(), vec![id]);
    assert!(store.operations().is_empty());
}

#[tokio::test]
async fn test_contract_violation_is_dead_lettered_before_any_transaction() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    stream.publish(
        EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"])
            .without("id")
            .to_json(),
    );
    let (mut worker, _shutdown) = worker(&stream, &store);

    worker.run_once().await.expect("run should succeed");

    let parked = stream.dead_letters();
    assert_eq!(parked.len(), 1);
    assert!(parked[0].error.starts_with("contract:"), "got {}", parked[0].error);
    assert!(!store.operations().contains(&Operation::Begin));
    assert_eq!(stream.acknowledged().len(), 1);
}

#[tokio::test]
async fn test_unaccepted_version_is_contract_failure_without_writes() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    stream.publish(EnvelopeBuilder::block_ready_v1("e-v1", "b-1", &["o-1"]).to_json());
    let (mut worker, _shutdown) = worker(&stream, &store);

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(summary.dead_lettered, 1);
    let parked = stream.dead_letters();
    assert!(
        parked[0].error.starts_with("contract:unsupported event type"),
        "got {}",
        parked[0].error
    );
    assert!(store.operations().iter().all(|op| !op.is_write()));
    assert_eq!(store.rollbacks(), 1);
}

#[tokio::test]
async fn test_legacy_version_is_projected_when_accepted() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    stream.publish(EnvelopeBuilder::block_ready_v1("e-v1", "b-1", &["o-1", "o-2"]).to_json());
    let policy = ProjectionPolicy::default().with_accepted_versions(AcceptedVersions::All);
    let (mut worker, _shutdown) = worker_with(&stream, &store, policy, fast_config());

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(summary.projected, 1);
    assert_eq!(store.snapshot().linked_orders("b-1"), vec!["o-1", "o-2"]);
}

#[tokio::test]
async fn test_strict_missing_orders_roll_back_and_dead_letter() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    let id = stream.publish(EnvelopeBuilder::block_ready_v2("e-miss", "b-1", &["o-1", "o-2"]).to_json());
    let (mut worker, _shutdown) = worker(&stream, &store);

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(
        summary.dead_lettered, 1,
        "strict mode parks the event instead of failing the run"
    );
    let parked = stream.dead_letters();
    assert!(
        parked[0].error.starts_with("projection:block b-1 references unknown orders"),
        "got {}",
        parked[0].error
    );
    assert_eq!(store.rollbacks(), 1);
    assert_eq!(store.commits(), 0);
    let state = store.snapshot();
    assert!(state.block("b-1").is_none());
    assert!(state.drivers.is_empty());
    assert!(state.processed_events.is_empty());
    assert_eq!(stream.acknowledged(), vec![id]);
}

#[tokio::test]
async fn test_lenient_policy_links_known_subset() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    stream.publish(EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1", "o-2"]).to_json());
    let (mut worker, _shutdown) =
        worker_with(&stream, &store, ProjectionPolicy::default().lenient(), fast_config());

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(summary.projected, 1);
    assert!(stream.dead_letters().is_empty());
    assert_eq!(store.snapshot().linked_orders("b-1"), vec!["o-1"]);
}

#[tokio::test]
async fn test_storage_failure_is_unexpected() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    store.fail_on(Operation::BulkLinkBlockOrders);
    stream.publish(EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"]).to_json());
    let (mut worker, _shutdown) = worker(&stream, &store);

    worker.run_once().await.expect("run should succeed");

    let parked = stream.dead_letters();
    assert!(parked[0].error.starts_with("unexpected:"), "got {}", parked[0].error);
    assert!(store.snapshot().block("b-1").is_none());
    assert_eq!(stream.acknowledged().len(), 1);
}

#[tokio::test]
async fn test_begin_failure_is_unexpected() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    store.fail_on(Operation::Begin);
    stream.publish(EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"]).to_json());
    let (mut worker, _shutdown) = worker(&stream, &store);

    let summary = worker.run_once().await.expect("run should succeed");

    assert_eq!(summary.dead_lettered, 1);
    assert!(stream.dead_letters()[0].error.starts_with("unexpected:transaction error"));
}

#[tokio::test]
async fn test_failed_dead_letter_leaves_message_pending() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    let id = stream.publish("{not json");
    stream.fail_dead_letters(true);
    let (mut worker, _shutdown) = worker(&stream, &store);

    let result = worker.run_once().await;

    assert!(
        matches!(result, Err(WorkerError::Stream(StreamError::DeadLetter(_)))),
        "got {result:?}"
    );
    assert!(stream.acknowledged().is_empty());
    assert_eq!(stream.pending_ids(), vec![id]);
}

#[tokio::test]
async fn test_failed_acknowledge_propagates() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    stream.publish_without_payload();
    stream.fail_acknowledgements(true);
    let (mut worker, _shutdown) = worker(&stream, &store);

    let result = worker.run_once().await;

    assert!(matches!(
        result,
        Err(WorkerError::Stream(StreamError::Acknowledge { .. }))
    ));
}

#[tokio::test]
async fn test_backlog_from_previous_run_is_processed_first() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    let crashed = stream.publish(EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"]).to_json());

    // A previous run read the entry and died before acknowledging it.
    let mut previous = stream.clone();
    previous.read(ReadCursor::New, 10, Duration::ZERO).await.unwrap();
    assert_eq!(stream.pending_ids(), vec![crashed.clone()]);

    let (mut worker, _shutdown) = worker(&stream, &store);
    let summary = worker.drain_backlog().await.expect("drain should succeed");

    assert_eq!(summary.projected, 1);
    assert_eq!(stream.acknowledged(), vec![crashed]);
    assert!(stream.pending_ids().is_empty());
}

#[tokio::test]
async fn test_transient_read_failures_are_retried() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    stream.publish_without_payload();
    stream.fail_next_reads(2);
    let (mut worker, _shutdown) = worker(&stream, &store);

    let summary = worker.run_once().await.expect("reads recover within budget");

    assert_eq!(summary.skipped, 1);
}

#[tokio::test]
async fn test_read_failures_beyond_budget_stop_the_worker() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    stream.fail_next_reads(10);
    let (mut worker, _shutdown) = worker(&stream, &store);

    let result = worker.run_once().await;

    assert!(matches!(
        result,
        Err(WorkerError::Stream(StreamError::Read(_)))
    ));
}

#[tokio::test]
async fn test_run_stops_between_batches_when_shutdown_is_set() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    stream.publish(EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"]).to_json());
    let (mut worker, shutdown) = worker(&stream, &store);
    shutdown.send(true).unwrap();

    let summary = tokio::time::timeout(Duration::from_secs(2), worker.run())
        .await
        .expect("run should return")
        .expect("run should succeed");

    // The start-up sweep still runs; the loop does not.
    assert_eq!(summary.projected, 1);
    assert_eq!(stream.undelivered(), 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_blocking_read() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::new();
    let config = WorkerConfig {
        block: Duration::from_secs(30),
        ..fast_config()
    };
    let (mut worker, shutdown) = worker_with(&stream, &store, ProjectionPolicy::default(), config);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(true).unwrap();
        // Keep the sender alive until the worker has observed the signal.
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let summary = tokio::time::timeout(Duration::from_secs(5), worker.run())
        .await
        .expect("shutdown should wake the worker")
        .expect("run should succeed");

    assert_eq!(summary, RunSummary::default());
}

#[tokio::test]
async fn test_continuous_run_processes_entries_published_later() {
    let stream = InMemoryStream::new();
    let store = InMemoryReadModelStore::with_orders(["o-1"]);
    let (mut worker, shutdown) = worker(&stream, &store);
    let publisher = stream.clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(EnvelopeBuilder::block_ready_v2("e-1", "b-1", &["o-1"]).to_json());
        publisher.publish("garbage");
        while publisher.acknowledged().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let summary = tokio::time::timeout(Duration::from_secs(5), worker.run())
        .await
        .expect("run should stop")
        .expect("run should succeed");

    assert_eq!(summary.projected, 1);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(
        stream.dead_letters()[0].error.split(':').next(),
        Some(DeadLetterReason::Json.tag())
    );
}
