use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{atomic::AtomicBool, Arc};

use workflow_manager::{
    logging::setup_test_logging,
    metrics::WorkflowMetricsCollector,
    scheduler::TaskScheduler,
    storage::Bucket,
    task::{AggregationTask, IntakeBatchTask, TaskEnqueuer, TaskPublisher},
    test_utils::{FailingPublisher, FixedClock, InMemoryObjectStore, RecordingPublisher},
};

const UUID_1: &str = "b8a5579a-f984-460a-a42d-2813cbf57771";
const UUID_A: &str = "aaaaaaaa-f984-460a-a42d-2813cbf57771";
const UUID_B: &str = "bbbbbbbb-f984-460a-a42d-2813cbf57771";
const UUID_C: &str = "cccccccc-f984-460a-a42d-2813cbf57771";
const UUID_D: &str = "dddddddd-f984-460a-a42d-2813cbf57771";

/// All scenarios run at 2020/10/31 20:45 UTC with a 1 hour intake max age, a
/// 3 hour aggregation period and a 30 minute grace period, making the
/// aggregation window [2020-10-31T18:00:00Z, 2020-10-31T21:00:00Z).
fn test_now() -> DateTime<Utc> {
    Utc.ymd(2020, 10, 31).and_hms(20, 45, 0)
}

struct TestWorkflow {
    intake_store: InMemoryObjectStore,
    own_validation_store: InMemoryObjectStore,
    peer_validation_store: InMemoryObjectStore,
    intake_publisher: Arc<RecordingPublisher<IntakeBatchTask>>,
    aggregate_publisher: Arc<RecordingPublisher<AggregationTask>>,
    metrics: WorkflowMetricsCollector,
}

impl TestWorkflow {
    fn new(test_name: &str) -> TestWorkflow {
        TestWorkflow {
            intake_store: InMemoryObjectStore::new("mem://ingestor"),
            own_validation_store: InMemoryObjectStore::new("mem://own-validation"),
            peer_validation_store: InMemoryObjectStore::new("mem://peer-validation"),
            intake_publisher: Arc::new(RecordingPublisher::new()),
            aggregate_publisher: Arc::new(RecordingPublisher::new()),
            metrics: WorkflowMetricsCollector::new_with_metric_name(
                test_name,
                "fake-namespace",
                "fake-ingestor",
            )
            .unwrap(),
        }
    }

    /// Runs one scheduling pass with the intake tasks going to the provided
    /// publisher, as the first (PHA) data share processor.
    fn run_with_intake_publisher(
        &self,
        intake_publisher: Arc<dyn TaskPublisher<IntakeBatchTask>>,
    ) -> anyhow::Result<()> {
        let logger = setup_test_logging();
        let scheduler = TaskScheduler::new(
            FixedClock { now: test_now() },
            Bucket::new_with_object_store(Box::new(self.intake_store.clone()), false, &logger),
            Bucket::new_with_object_store(
                Box::new(self.own_validation_store.clone()),
                false,
                &logger,
            ),
            Bucket::new_with_object_store(
                Box::new(self.peer_validation_store.clone()),
                false,
                &logger,
            ),
            true,
            Duration::hours(1),
            Duration::hours(3),
            Duration::minutes(30),
            self.metrics.clone(),
            &logger,
        );
        let intake_enqueuer = TaskEnqueuer::new(intake_publisher, 4, &logger).unwrap();
        let aggregate_enqueuer =
            TaskEnqueuer::new(self.aggregate_publisher.clone(), 4, &logger).unwrap();
        scheduler.run(intake_enqueuer, aggregate_enqueuer, &AtomicBool::new(false))
    }

    fn run(&self) -> anyhow::Result<()> {
        self.run_with_intake_publisher(self.intake_publisher.clone())
    }
}

/// Seeds all three objects of a batch.
fn seed_batch(
    store: &InMemoryObjectStore,
    aggregation_id: &str,
    date: &str,
    batch_id: &str,
    infix: &str,
) {
    for extension in ["", ".avro", ".sig"] {
        store.put_object(
            &format!(
                "{}/{}/{}.{}{}",
                aggregation_id, date, batch_id, infix, extension
            ),
            b"",
        );
    }
}

#[test]
fn intake_happy_path() {
    let workflow = TestWorkflow::new("intake_happy_path");
    seed_batch(
        &workflow.intake_store,
        "kittens-seen",
        "2020/10/31/20/29",
        UUID_1,
        "batch",
    );

    workflow.run().unwrap();

    assert_eq!(
        workflow.intake_publisher.published(),
        vec![IntakeBatchTask {
            aggregation_id: "kittens-seen".to_owned(),
            batch_id: UUID_1.to_owned(),
            date: "2020/10/31/20/29".to_owned(),
        }]
    );
    assert!(workflow.own_validation_store.contains_key(&format!(
        "task-markers/intake-kittens-seen-{}",
        UUID_1
    )));
    assert_eq!(workflow.metrics.intake_tasks_scheduled.get(), 1);
    assert_eq!(workflow.metrics.intake_tasks_skipped_due_to_marker.get(), 0);
}

#[test]
fn intake_rerun_is_idempotent() {
    let workflow = TestWorkflow::new("intake_rerun_is_idempotent");
    seed_batch(
        &workflow.intake_store,
        "kittens-seen",
        "2020/10/31/20/29",
        UUID_1,
        "batch",
    );

    workflow.run().unwrap();
    // Second run with identical bucket state except for the marker written by
    // the first run: nothing further may be enqueued
    workflow.run().unwrap();

    assert_eq!(workflow.intake_publisher.published().len(), 1);
    assert_eq!(workflow.metrics.intake_tasks_scheduled.get(), 1);
    assert_eq!(workflow.metrics.intake_tasks_skipped_due_to_marker.get(), 1);
}

#[test]
fn incomplete_batch_is_skipped() {
    let workflow = TestWorkflow::new("incomplete_batch_is_skipped");
    // No .batch.sig object
    workflow.intake_store.put_object(
        &format!("kittens-seen/2020/10/31/20/29/{}.batch", UUID_1),
        b"",
    );
    workflow.intake_store.put_object(
        &format!("kittens-seen/2020/10/31/20/29/{}.batch.avro", UUID_1),
        b"",
    );

    workflow.run().unwrap();

    assert!(workflow.intake_publisher.published().is_empty());
    assert!(workflow.own_validation_store.keys().is_empty());
}

#[test]
fn batch_outside_intake_window_is_skipped() {
    let workflow = TestWorkflow::new("batch_outside_intake_window_is_skipped");
    // 19:29 is more than intake-max-age (1h) before 20:45
    seed_batch(
        &workflow.intake_store,
        "kittens-seen",
        "2020/10/31/19/29",
        UUID_1,
        "batch",
    );

    workflow.run().unwrap();

    assert!(workflow.intake_publisher.published().is_empty());
}

#[test]
fn aggregation_intersection() {
    let workflow = TestWorkflow::new("aggregation_intersection");
    seed_batch(
        &workflow.intake_store,
        "kittens-seen",
        "2020/10/31/20/29",
        UUID_1,
        "batch",
    );
    // Own validations exist for A, B and C; peer validations for B, C and D.
    // Only B and C may be aggregated.
    for batch_id in [UUID_A, UUID_B, UUID_C] {
        seed_batch(
            &workflow.own_validation_store,
            "kittens-seen",
            "2020/10/31/20/29",
            batch_id,
            "validity_0",
        );
    }
    for batch_id in [UUID_B, UUID_C, UUID_D] {
        seed_batch(
            &workflow.peer_validation_store,
            "kittens-seen",
            "2020/10/31/20/29",
            batch_id,
            "validity_1",
        );
    }

    workflow.run().unwrap();

    let published = workflow.aggregate_publisher.published();
    assert_eq!(published.len(), 1);
    let task = &published[0];
    assert_eq!(task.aggregation_id, "kittens-seen");
    assert_eq!(task.aggregation_start, "2020/10/31/18/00");
    assert_eq!(task.aggregation_end, "2020/10/31/21/00");
    let batch_ids: Vec<&str> = task.batches.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(batch_ids, vec![UUID_B, UUID_C]);

    assert!(workflow.own_validation_store.contains_key(
        "task-markers/aggregate-kittens-seen-2020-10-31T18:00:00Z-2020-10-31T21:00:00Z"
    ));
    assert_eq!(workflow.metrics.aggregate_tasks_scheduled.get(), 1);
}

#[test]
fn aggregation_marker_present() {
    let workflow = TestWorkflow::new("aggregation_marker_present");
    seed_batch(
        &workflow.intake_store,
        "kittens-seen",
        "2020/10/31/20/29",
        UUID_1,
        "batch",
    );
    seed_batch(
        &workflow.own_validation_store,
        "kittens-seen",
        "2020/10/31/20/29",
        UUID_B,
        "validity_0",
    );
    seed_batch(
        &workflow.peer_validation_store,
        "kittens-seen",
        "2020/10/31/20/29",
        UUID_B,
        "validity_1",
    );
    workflow.own_validation_store.put_object(
        "task-markers/aggregate-kittens-seen-2020-10-31T18:00:00Z-2020-10-31T21:00:00Z",
        b"",
    );

    workflow.run().unwrap();

    assert!(workflow.aggregate_publisher.published().is_empty());
    assert_eq!(workflow.metrics.aggregate_tasks_scheduled.get(), 0);
    assert_eq!(
        workflow.metrics.aggregate_tasks_skipped_due_to_marker.get(),
        1
    );
}

#[test]
fn no_aggregate_task_without_peer_validations() {
    let workflow = TestWorkflow::new("no_aggregate_task_without_peer_validations");
    seed_batch(
        &workflow.intake_store,
        "kittens-seen",
        "2020/10/31/20/29",
        UUID_1,
        "batch",
    );
    seed_batch(
        &workflow.own_validation_store,
        "kittens-seen",
        "2020/10/31/20/29",
        UUID_B,
        "validity_0",
    );

    workflow.run().unwrap();

    assert!(workflow.aggregate_publisher.published().is_empty());
}

#[test]
fn publish_failure_leaves_task_recoverable() {
    let workflow = TestWorkflow::new("publish_failure_leaves_task_recoverable");
    seed_batch(
        &workflow.intake_store,
        "kittens-seen",
        "2020/10/31/20/29",
        UUID_1,
        "batch",
    );

    // A per-task publish failure is reported via the completion callback and
    // does not fail the run
    workflow
        .run_with_intake_publisher(Arc::new(FailingPublisher {}))
        .unwrap();

    // No marker was written, so the task is still pending
    assert!(workflow.own_validation_store.keys().is_empty());
    assert_eq!(workflow.metrics.intake_tasks_scheduled.get(), 0);

    // The next run, with a healthy broker, enqueues the same task
    workflow.run().unwrap();
    assert_eq!(
        workflow.intake_publisher.published(),
        vec![IntakeBatchTask {
            aggregation_id: "kittens-seen".to_owned(),
            batch_id: UUID_1.to_owned(),
            date: "2020/10/31/20/29".to_owned(),
        }]
    );
    assert!(workflow.own_validation_store.contains_key(&format!(
        "task-markers/intake-kittens-seen-{}",
        UUID_1
    )));
}

#[test]
fn empty_buckets_are_a_no_op() {
    let workflow = TestWorkflow::new("empty_buckets_are_a_no_op");

    workflow.run().unwrap();

    assert!(workflow.intake_publisher.published().is_empty());
    assert!(workflow.aggregate_publisher.published().is_empty());
}

#[test]
fn aggregation_ids_absent_from_intake_bucket_are_ignored() {
    let workflow = TestWorkflow::new("aggregation_ids_absent_from_intake_bucket_are_ignored");
    // Validations exist for an aggregation ID with no intake presence. There
    // can be no intake task, so there will be no new aggregation either.
    seed_batch(
        &workflow.own_validation_store,
        "puppies-seen",
        "2020/10/31/20/29",
        UUID_B,
        "validity_0",
    );
    seed_batch(
        &workflow.peer_validation_store,
        "puppies-seen",
        "2020/10/31/20/29",
        UUID_B,
        "validity_1",
    );

    workflow.run().unwrap();

    assert!(workflow.intake_publisher.published().is_empty());
    assert!(workflow.aggregate_publisher.published().is_empty());
}
