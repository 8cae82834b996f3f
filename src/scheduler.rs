use anyhow::{Context, Result};
use chrono::Duration;
use slog::{error, info, o, Logger};
use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, Ordering},
};
use uuid::Uuid;

use crate::{
    batch_path::assemble_batches,
    clock::{intake_interval, prev_aligned_window, Clock, Interval},
    logging::event,
    metrics::WorkflowMetricsCollector,
    storage::Bucket,
    task::{
        aggregate_task_marker, intake_task_marker, AggregationTask, Batch, IntakeBatchTask,
        TaskEnqueuer,
    },
    DATE_FORMAT,
};

/// TaskScheduler is the heart of the workflow manager: it discovers ready
/// batches in cloud storage and enqueues intake and aggregate tasks for the
/// stateless workers, using task markers to guarantee that a task is enqueued
/// at most once across runs. Each run is stateless; a batch missed by one run
/// (because of a crash, a publish failure or a slow listing) is picked up by
/// the next one, because its marker is still absent.
pub struct TaskScheduler<C: Clock> {
    clock: C,
    intake_bucket: Bucket,
    own_validation_bucket: Bucket,
    peer_validation_bucket: Bucket,
    is_first: bool,
    intake_max_age: Duration,
    aggregation_period: Duration,
    grace_period: Duration,
    metrics: WorkflowMetricsCollector,
    logger: Logger,
}

impl<C: Clock> TaskScheduler<C> {
    pub fn new(
        clock: C,
        intake_bucket: Bucket,
        own_validation_bucket: Bucket,
        peer_validation_bucket: Bucket,
        is_first: bool,
        intake_max_age: Duration,
        aggregation_period: Duration,
        grace_period: Duration,
        metrics: WorkflowMetricsCollector,
        parent_logger: &Logger,
    ) -> TaskScheduler<C> {
        TaskScheduler {
            clock,
            intake_bucket,
            own_validation_bucket,
            peer_validation_bucket,
            is_first,
            intake_max_age,
            aggregation_period,
            grace_period,
            metrics,
            logger: parent_logger.new(o!()),
        }
    }

    /// Runs one scheduling pass over every aggregation ID discovered in the
    /// intake bucket, then stops both enqueuers, blocking until all
    /// completion callbacks have run. An error in one aggregation ID is
    /// logged and does not prevent scheduling for the others; only a failure
    /// to discover aggregation IDs at all fails the run. A pending
    /// termination request is honored between aggregation IDs.
    pub fn run(
        &self,
        intake_enqueuer: TaskEnqueuer<IntakeBatchTask>,
        aggregate_enqueuer: TaskEnqueuer<AggregationTask>,
        terminate: &AtomicBool,
    ) -> Result<()> {
        let now = self.clock.now();
        let intake_window = intake_interval(now, self.intake_max_age);
        let aggregation_window =
            prev_aligned_window(now, self.aggregation_period, self.grace_period);
        info!(
            self.logger, "scheduling tasks";
            "intake_interval" => intake_window.to_string(),
            "aggregation_interval" => aggregation_window.to_string(),
        );

        let discovery = self.intake_bucket.list_aggregation_ids();
        if let Ok(aggregation_ids) = &discovery {
            for aggregation_id in aggregation_ids {
                if terminate.load(Ordering::Relaxed) {
                    info!(self.logger, "termination requested, stopping early");
                    break;
                }
                let logger = self
                    .logger
                    .new(o!(event::AGGREGATION_ID => aggregation_id.clone()));
                let result = self
                    .schedule_intake_tasks(aggregation_id, &intake_window, &intake_enqueuer, &logger)
                    .and_then(|_| {
                        self.schedule_aggregate_task(
                            aggregation_id,
                            &aggregation_window,
                            &aggregate_enqueuer,
                            &logger,
                        )
                    });
                // A failure in one aggregation ID must not prevent scheduling
                // for the others
                if let Err(error) = result {
                    error!(logger, "failed to schedule tasks: {:?}", error);
                }
            }
        }

        // Block until every accepted task's completion callback has returned.
        // Only after both stops is it safe to exit the process.
        intake_enqueuer.stop();
        aggregate_enqueuer.stop();

        discovery
            .map(|_| ())
            .context("failed to discover aggregation IDs in intake bucket")
    }

    /// Enqueues an intake task for every complete batch in the window that
    /// does not yet have a task marker. Markers are written from the
    /// enqueuer's completion callback, only once the broker has acknowledged
    /// the task.
    fn schedule_intake_tasks(
        &self,
        aggregation_id: &str,
        window: &Interval,
        enqueuer: &TaskEnqueuer<IntakeBatchTask>,
        logger: &Logger,
    ) -> Result<()> {
        let intake_files = self
            .intake_bucket
            .list_batch_files(aggregation_id, window)
            .context("failed to list intake batch files")?;
        let intake_batches = assemble_batches(logger, &intake_files, "batch");
        let markers = self
            .own_validation_bucket
            .list_intake_task_markers(aggregation_id, window)
            .context("failed to list intake task markers")?;

        info!(
            logger, "discovered {} complete intake batches", intake_batches.len();
            event::INTERVAL => window.to_string(),
        );

        for batch in intake_batches {
            let marker = intake_task_marker(aggregation_id, &batch.path().batch_id);
            if markers.contains(&marker) {
                self.metrics.intake_tasks_skipped_due_to_marker.inc();
                continue;
            }

            let task = IntakeBatchTask::from_batch_path(batch.path());
            let callback_logger = logger.new(o!(
                event::BATCH_ID => batch.path().batch_id.to_string(),
                event::TASK_MARKER => marker.clone(),
            ));
            let own_validation_bucket = self.own_validation_bucket.clone();
            let scheduled = self.metrics.intake_tasks_scheduled.clone();
            enqueuer.enqueue(
                task,
                Box::new(move |result| match result {
                    Ok(()) => {
                        // The task was published. If the marker write fails,
                        // the next run will enqueue the task again; workers
                        // tolerate duplicate tasks because handling is
                        // idempotent by batch ID.
                        if let Err(error) = own_validation_bucket.write_task_marker(&marker) {
                            error!(
                                callback_logger,
                                "failed to write intake task marker: {:?}", error
                            );
                        }
                        scheduled.inc();
                    }
                    Err(error) => {
                        error!(callback_logger, "failed to enqueue intake task: {:?}", error)
                    }
                }),
            )?;
        }

        Ok(())
    }

    /// Enqueues an aggregate task covering the batches that both data share
    /// processors have validated within the aggregation window, unless the
    /// window's task marker exists or there is nothing to aggregate.
    fn schedule_aggregate_task(
        &self,
        aggregation_id: &str,
        window: &Interval,
        enqueuer: &TaskEnqueuer<AggregationTask>,
        logger: &Logger,
    ) -> Result<()> {
        // This data share processor's role decides which validity index is
        // ours and which is our peer's: the first (PHA) server emits
        // validity_0
        let (own_validity_infix, peer_validity_infix) = if self.is_first {
            ("validity_0", "validity_1")
        } else {
            ("validity_1", "validity_0")
        };

        let own_files = self
            .own_validation_bucket
            .list_batch_files(aggregation_id, window)
            .context("failed to list own validation batch files")?;
        let own_batches = assemble_batches(logger, &own_files, own_validity_infix);
        let peer_files = self
            .peer_validation_bucket
            .list_batch_files(aggregation_id, window)
            .context("failed to list peer validation batch files")?;
        let peer_batches = assemble_batches(logger, &peer_files, peer_validity_infix);

        // Only batches that both processors have validated can be aggregated.
        // Intersect by batch ID, preserving peer ordering so that every run
        // constructs the same batch list.
        let own_batch_ids: HashSet<Uuid> =
            own_batches.iter().map(|b| b.path().batch_id).collect();
        let aggregation_batches: Vec<Batch> = peer_batches
            .iter()
            .filter(|b| own_batch_ids.contains(&b.path().batch_id))
            .map(|b| Batch {
                id: b.path().batch_id.to_string(),
                time: b.path().time.format(DATE_FORMAT).to_string(),
            })
            .collect();

        let markers = self
            .own_validation_bucket
            .list_aggregate_task_markers(aggregation_id)
            .context("failed to list aggregate task markers")?;
        let marker = aggregate_task_marker(aggregation_id, window);
        if markers.contains(&marker) {
            info!(
                logger, "skipping aggregate task: marker exists";
                event::TASK_MARKER => marker,
            );
            self.metrics.aggregate_tasks_skipped_due_to_marker.inc();
            return Ok(());
        }
        if aggregation_batches.is_empty() {
            info!(
                logger, "no batches to aggregate";
                event::INTERVAL => window.to_string(),
            );
            return Ok(());
        }

        let task = AggregationTask {
            aggregation_id: aggregation_id.to_owned(),
            aggregation_start: window.begin.format(DATE_FORMAT).to_string(),
            aggregation_end: window.end.format(DATE_FORMAT).to_string(),
            batches: aggregation_batches,
        };
        let callback_logger = logger.new(o!(
            event::TASK_MARKER => marker.clone(),
        ));
        let own_validation_bucket = self.own_validation_bucket.clone();
        let scheduled = self.metrics.aggregate_tasks_scheduled.clone();
        enqueuer.enqueue(
            task,
            Box::new(move |result| match result {
                Ok(()) => {
                    if let Err(error) = own_validation_bucket.write_task_marker(&marker) {
                        error!(
                            callback_logger,
                            "failed to write aggregate task marker: {:?}", error
                        );
                    }
                    scheduled.inc();
                }
                Err(error) => {
                    error!(callback_logger, "failed to enqueue aggregate task: {:?}", error)
                }
            }),
        )?;

        Ok(())
    }
}
