mod pubsub;
mod sns;

use anyhow::{Context, Result};
use rusoto_sns::PublishError as SnsPublishError;
use serde::{Deserialize, Serialize};
use slog::{error, info, o, Logger};
use std::{
    fmt,
    fmt::{Debug, Display},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};
use uuid::Uuid;

pub use pubsub::GcpPubSubTaskPublisher;
pub use sns::AwsSnsTaskPublisher;

use crate::{
    batch_path::BatchPath,
    clock::{rfc3339, Interval},
    logging::event,
    DATE_FORMAT,
};

/// Represents a task that can be enqueued for a worker
pub trait Task:
    Debug
    + Display
    + PartialEq
    + Clone
    + Send
    + Sized
    + Sync
    + Serialize
    + serde::de::DeserializeOwned
    + 'static
{
}

/// Represents an intake batch task to be executed
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IntakeBatchTask {
    /// The identifier for the aggregation
    pub aggregation_id: String,
    /// The identifier of the batch, typically a UUID
    pub batch_id: String,
    /// The UTC timestamp on the batch, with minute precision, formatted like
    /// "2006/01/02/15/04"
    pub date: String,
}

impl IntakeBatchTask {
    pub fn from_batch_path(path: &BatchPath) -> IntakeBatchTask {
        IntakeBatchTask {
            aggregation_id: path.aggregation_id.clone(),
            batch_id: path.batch_id.to_string(),
            date: path.time.format(DATE_FORMAT).to_string(),
        }
    }
}

impl Task for IntakeBatchTask {}

impl Display for IntakeBatchTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "aggregation ID: {}, batch ID: {}, date: {}",
            self.aggregation_id, self.batch_id, self.date
        )
    }
}

/// Represents an aggregation task to be executed
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AggregationTask {
    /// The identifier for the aggregation
    pub aggregation_id: String,
    /// The start of the range of time covered by the aggregation in UTC, with
    /// minute precision, formatted like "2006/01/02/15/04"
    pub aggregation_start: String,
    /// The end of the range of time covered by the aggregation in UTC, with
    /// minute precision, formatted like "2006/01/02/15/04"
    pub aggregation_end: String,
    // The list of batches aggregated by this task
    pub batches: Vec<Batch>,
}

impl Task for AggregationTask {}

impl Display for AggregationTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "aggregation ID: {}, aggregation start: {}, aggregation end: {}, number of batches: {}",
            self.aggregation_id,
            self.aggregation_start,
            self.aggregation_end,
            self.batches.len()
        )
    }
}

/// Represents a batch included in an aggregation
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Batch {
    /// The identifier of the batch. Typically a UUID.
    pub id: String,
    /// The timestamp on the batch, in UTC, with minute precision, formatted
    /// like "2006/01/02/15/04".
    pub time: String,
}

/// The name of the marker that records that an intake task for this batch was
/// enqueued.
pub fn intake_task_marker(aggregation_id: &str, batch_id: &Uuid) -> String {
    format!("intake-{}-{}", aggregation_id, batch_id)
}

/// The name of the marker that records that an aggregate task for this window
/// was enqueued. Window boundaries are epoch-aligned, so every scheduler run
/// derives the same name for the same window.
pub fn aggregate_task_marker(aggregation_id: &str, window: &Interval) -> String {
    format!(
        "aggregate-{}-{}-{}",
        aggregation_id,
        rfc3339(&window.begin),
        rfc3339(&window.end)
    )
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("failed to encode task as JSON: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("error publishing task to PubSub: {0}")]
    PubSub(#[source] crate::Error),
    #[error("error publishing task to SNS: {0}")]
    Sns(#[source] rusoto_core::RusotoError<SnsPublishError>),
    #[error("failed to create SNS client: {0}")]
    SnsClient(#[source] anyhow::Error),
}

/// Publishes tasks to some message broker. publish returns once the broker
/// has acknowledged the message or the publish has permanently failed.
pub trait TaskPublisher<T: Task>: Debug + Send + Sync + 'static {
    fn publish(&self, task: &T) -> Result<(), EnqueueError>;
}

/// A completion callback provided with an enqueued task. Invoked exactly
/// once, on an enqueuer worker thread, with the outcome of the publish.
pub type OnComplete = Box<dyn FnOnce(Result<(), EnqueueError>) + Send + 'static>;

/// TaskEnqueuer accepts tasks and publishes them from a bounded pool of
/// worker threads. `enqueue` returns as soon as the task is handed to the
/// pool; the completion callback runs after the broker has acknowledged the
/// publish or it has permanently failed. `stop` blocks until every
/// outstanding callback has returned, so once it does, it is safe for the
/// process to exit.
pub struct TaskEnqueuer<T: Task> {
    sender: mpsc::Sender<EnqueuedTask<T>>,
    workers: Vec<JoinHandle<()>>,
    logger: Logger,
}

struct EnqueuedTask<T: Task> {
    task: T,
    on_complete: OnComplete,
}

impl<T: Task> TaskEnqueuer<T> {
    pub fn new(
        publisher: Arc<dyn TaskPublisher<T>>,
        max_workers: usize,
        parent_logger: &Logger,
    ) -> Result<TaskEnqueuer<T>> {
        let logger = parent_logger.new(o!());
        let (sender, receiver) = mpsc::channel::<EnqueuedTask<T>>();
        // mpsc receivers cannot be cloned, so the workers share one behind a
        // mutex, each holding it only while waiting for the next task.
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(max_workers);
        for worker_index in 0..max_workers {
            let receiver = Arc::clone(&receiver);
            let publisher = Arc::clone(&publisher);
            let handle = thread::Builder::new()
                .name(format!("enqueuer-worker-{}", worker_index))
                .spawn(move || loop {
                    let enqueued = match receiver.lock().unwrap().recv() {
                        Ok(enqueued) => enqueued,
                        // The channel is closed and drained: stop() was called
                        Err(mpsc::RecvError) => break,
                    };
                    let result = publisher.publish(&enqueued.task);
                    (enqueued.on_complete)(result);
                })
                .context("failed to spawn enqueuer worker thread")?;
            workers.push(handle);
        }

        Ok(TaskEnqueuer {
            sender,
            workers,
            logger,
        })
    }

    /// Hands a task to the worker pool. The completion callback is invoked
    /// exactly once per call. A publish failure is reported only through the
    /// callback; the absent task marker ensures the task is enqueued again on
    /// the next scheduler run.
    pub fn enqueue(&self, task: T, on_complete: OnComplete) -> Result<()> {
        info!(self.logger, "enqueueing task: {}", task);
        self.sender
            .send(EnqueuedTask { task, on_complete })
            .map_err(|_| anyhow::anyhow!("all enqueuer workers have exited"))
    }

    /// Shuts down the worker pool, blocking until every accepted task's
    /// completion callback has returned. No callback executes after stop
    /// returns. Per-task failures are reported through the callbacks, never
    /// through stop.
    pub fn stop(self) {
        drop(self.sender);
        for worker in self.workers {
            if worker.join().is_err() {
                error!(self.logger, "enqueuer worker panicked");
            }
        }
    }
}

/// A publisher that logs tasks instead of sending them, used in dry runs so
/// that a run is safe end to end.
#[derive(Clone, Debug)]
pub struct LoggingPublisher {
    logger: Logger,
}

impl LoggingPublisher {
    pub fn new(parent_logger: &Logger, task_queue_id: &str) -> LoggingPublisher {
        let logger = parent_logger.new(o!(
            event::TASK_QUEUE_ID => task_queue_id.to_owned(),
        ));
        LoggingPublisher { logger }
    }
}

impl<T: Task> TaskPublisher<T> for LoggingPublisher {
    fn publish(&self, task: &T) -> Result<(), EnqueueError> {
        info!(self.logger, "dry run: would publish task: {}", task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        logging::setup_test_logging,
        test_utils::{FailingPublisher, RecordingPublisher},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fake_intake_task(n: u32) -> IntakeBatchTask {
        IntakeBatchTask {
            aggregation_id: "fake-aggregation".to_owned(),
            batch_id: format!("00000000-0000-0000-0000-{:012}", n),
            date: "2020/10/31/20/29".to_owned(),
        }
    }

    #[test]
    fn intake_task_json() {
        let task = IntakeBatchTask {
            aggregation_id: "kittens-seen".to_owned(),
            batch_id: "b8a5579a-f984-460a-a42d-2813cbf57771".to_owned(),
            date: "2020/10/31/20/29".to_owned(),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "aggregation-id": "kittens-seen",
                "batch-id": "b8a5579a-f984-460a-a42d-2813cbf57771",
                "date": "2020/10/31/20/29",
            })
        );
        assert_eq!(
            serde_json::from_value::<IntakeBatchTask>(json).unwrap(),
            task
        );
    }

    #[test]
    fn aggregation_task_json() {
        let task = AggregationTask {
            aggregation_id: "kittens-seen".to_owned(),
            aggregation_start: "2020/10/31/18/00".to_owned(),
            aggregation_end: "2020/10/31/21/00".to_owned(),
            batches: vec![Batch {
                id: "b8a5579a-f984-460a-a42d-2813cbf57771".to_owned(),
                time: "2020/10/31/20/29".to_owned(),
            }],
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "aggregation-id": "kittens-seen",
                "aggregation-start": "2020/10/31/18/00",
                "aggregation-end": "2020/10/31/21/00",
                "batches": [
                    {"id": "b8a5579a-f984-460a-a42d-2813cbf57771", "time": "2020/10/31/20/29"},
                ],
            })
        );
    }

    #[test]
    fn marker_names() {
        use chrono::TimeZone;
        let batch_id: Uuid = "b8a5579a-f984-460a-a42d-2813cbf57771".parse().unwrap();
        assert_eq!(
            intake_task_marker("kittens-seen", &batch_id),
            "intake-kittens-seen-b8a5579a-f984-460a-a42d-2813cbf57771"
        );

        let window = Interval::new(
            chrono::Utc.ymd(2020, 10, 31).and_hms(18, 0, 0),
            chrono::Utc.ymd(2020, 10, 31).and_hms(21, 0, 0),
        );
        assert_eq!(
            aggregate_task_marker("kittens-seen", &window),
            "aggregate-kittens-seen-2020-10-31T18:00:00Z-2020-10-31T21:00:00Z"
        );
    }

    #[test]
    fn enqueuer_invokes_every_callback_before_stop_returns() {
        let logger = setup_test_logging();
        let publisher: Arc<RecordingPublisher<IntakeBatchTask>> =
            Arc::new(RecordingPublisher::new());
        let enqueuer = TaskEnqueuer::new(publisher.clone(), 4, &logger).unwrap();

        let completed = Arc::new(AtomicUsize::new(0));
        const TASK_COUNT: u32 = 50;
        for n in 0..TASK_COUNT {
            let completed = Arc::clone(&completed);
            enqueuer
                .enqueue(
                    fake_intake_task(n),
                    Box::new(move |result| {
                        result.unwrap();
                        completed.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }

        enqueuer.stop();

        // Once stop has returned, every callback must have run
        assert_eq!(completed.load(Ordering::SeqCst), TASK_COUNT as usize);
        assert_eq!(publisher.published().len(), TASK_COUNT as usize);
    }

    #[test]
    fn enqueuer_reports_publish_failure_via_callback() {
        let logger = setup_test_logging();
        let publisher: Arc<FailingPublisher> = Arc::new(FailingPublisher {});
        let enqueuer: TaskEnqueuer<IntakeBatchTask> =
            TaskEnqueuer::new(publisher, 2, &logger).unwrap();

        let saw_error = Arc::new(AtomicUsize::new(0));
        let saw_error_clone = Arc::clone(&saw_error);
        enqueuer
            .enqueue(
                fake_intake_task(0),
                Box::new(move |result| {
                    assert!(result.is_err());
                    saw_error_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        enqueuer.stop();
        assert_eq!(saw_error.load(Ordering::SeqCst), 1);
    }
}
