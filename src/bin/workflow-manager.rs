use anyhow::{anyhow, Context, Result};
use chrono::prelude::Utc;
use clap::{value_t, App, Arg, ArgMatches};
use slog::{error, info, Logger};
use std::{
    env,
    str::FromStr,
    sync::{
        atomic::AtomicBool,
        Arc,
    },
    time::Instant,
};
use tokio::runtime;

use workflow_manager::{
    clock::RealClock,
    config::{leak_string, DayDuration, Identity, StoragePath, TaskQueueKind},
    logging::{setup_logging, LoggingConfiguration},
    metrics::{push_metrics, ApiClientMetricsCollector, WorkflowMetricsCollector},
    scheduler::TaskScheduler,
    storage::Bucket,
    task::{
        AggregationTask, AwsSnsTaskPublisher, GcpPubSubTaskPublisher, IntakeBatchTask,
        LoggingPublisher, TaskEnqueuer, TaskPublisher,
    },
};

fn num_validator<F: FromStr>(s: String) -> Result<(), String> {
    s.parse::<F>()
        .map(|_| ())
        .map_err(|_| "could not parse value as number".to_owned())
}

fn duration_validator(s: String) -> Result<(), String> {
    DayDuration::from_str(&s).map(|_| ())
}

fn path_validator(s: String) -> Result<(), String> {
    StoragePath::from_str(&s)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn upper_snake_case(s: &str) -> String {
    s.to_uppercase().replace('-', "_")
}

// Trait applied to clap::App to extend its builder pattern with some helpers
// specific to our use case.
trait AppArgumentAdder {
    fn add_storage_arguments(self, entity: &'static str) -> Self;
}

impl<'a, 'b> AppArgumentAdder for App<'a, 'b> {
    fn add_storage_arguments(self: App<'a, 'b>, entity: &'static str) -> App<'a, 'b> {
        let input_name = leak_string(format!("{}-input", entity));
        let identity_name = leak_string(format!("{}-identity", entity));
        self.arg(
            Arg::with_name(input_name)
                .long(input_name)
                .env(leak_string(upper_snake_case(input_name)))
                .value_name("PATH")
                .required(true)
                .validator(path_validator)
                .help(leak_string(format!(
                    "Storage path (gs://<bucket> or s3://<region>/<bucket>) \
                    of the {} bucket",
                    entity
                ))),
        )
        .arg(
            Arg::with_name(identity_name)
                .long(identity_name)
                .env(leak_string(upper_snake_case(identity_name)))
                .value_name("IAM_ROLE_OR_SERVICE_ACCOUNT")
                .default_value("")
                .help(leak_string(format!(
                    "Identity to assume when accessing the {} bucket. \
                    Should be an AWS IAM role ARN (required for s3:// \
                    buckets) or a GCP service account email (optional for \
                    gs:// buckets; the default service account is used if \
                    omitted).",
                    entity
                ))),
        )
    }
}

fn app() -> App<'static, 'static> {
    App::new("workflow-manager")
        .about("Prio data share processor workflow manager: discovers batches in cloud storage and schedules intake and aggregate tasks for workers")
        // Environment variables are injected via build.rs
        .version(leak_string(format!(
            "{} {} {}",
            env!("VERGEN_SEMVER"),
            env!("VERGEN_SHA_SHORT"),
            env!("VERGEN_BUILD_TIMESTAMP"),
        )))
        .arg(
            Arg::with_name("force-json-log-output")
                .long("force-json-log-output")
                .env("FORCE_JSON_LOG_OUTPUT")
                .value_name("BOOL")
                .possible_value("true")
                .possible_value("false")
                .default_value("false")
                .help("Force log output to JSON format"),
        )
        .arg(
            Arg::with_name("k8s-namespace")
                .long("k8s-namespace")
                .env("K8S_NAMESPACE")
                .value_name("NAMESPACE")
                .default_value("")
                .help("Kubernetes namespace this instance runs in, used as a metrics label"),
        )
        .arg(
            Arg::with_name("ingestor-label")
                .long("ingestor-label")
                .env("INGESTOR_LABEL")
                .value_name("LABEL")
                .default_value("")
                .help("Name of the ingestion server whose batches are scheduled, used as a metrics label"),
        )
        .arg(
            Arg::with_name("is-first")
                .long("is-first")
                .env("IS_FIRST")
                .value_name("BOOL")
                .possible_value("true")
                .possible_value("false")
                .required(true)
                .help(
                    "Whether this is the \"first\" server receiving a share, \
                    i.e., the PHA. The first server emits validity_0 shares.",
                ),
        )
        .arg(
            Arg::with_name("intake-max-age")
                .long("intake-max-age")
                .env("INTAKE_MAX_AGE")
                .value_name("DURATION")
                .default_value("1h")
                .validator(duration_validator)
                .help("How far back to look for batches to intake (e.g. 1h30m)"),
        )
        .arg(
            Arg::with_name("aggregation-period")
                .long("aggregation-period")
                .env("AGGREGATION_PERIOD")
                .value_name("DURATION")
                .default_value("8h")
                .validator(duration_validator)
                .help("Length of the aggregation window (e.g. 8h)"),
        )
        .arg(
            Arg::with_name("grace-period")
                .long("grace-period")
                .env("GRACE_PERIOD")
                .value_name("DURATION")
                .default_value("4h")
                .validator(duration_validator)
                .help(
                    "How long to wait after the close of an aggregation \
                    window before scheduling its aggregate task, to allow \
                    late validation batches to land",
                ),
        )
        .add_storage_arguments("ingestor")
        .add_storage_arguments("own-validation")
        .add_storage_arguments("peer-validation")
        .arg(
            Arg::with_name("task-queue-kind")
                .long("task-queue-kind")
                .env("TASK_QUEUE_KIND")
                .value_name("KIND")
                .possible_value(leak_string(TaskQueueKind::GcpPubSub.to_string()))
                .possible_value(leak_string(TaskQueueKind::AwsSns.to_string()))
                .required(true)
                .help("Which task queue tasks are published to"),
        )
        .arg(
            Arg::with_name("intake-tasks-topic")
                .long("intake-tasks-topic")
                .env("INTAKE_TASKS_TOPIC")
                .value_name("TOPIC")
                .required(true)
                .help("Name of the topic intake tasks are published to"),
        )
        .arg(
            Arg::with_name("aggregate-tasks-topic")
                .long("aggregate-tasks-topic")
                .env("AGGREGATE_TASKS_TOPIC")
                .value_name("TOPIC")
                .required(true)
                .help("Name of the topic aggregate tasks are published to"),
        )
        .arg(
            Arg::with_name("gcp-project-id")
                .long("gcp-project-id")
                .env("GCP_PROJECT_ID")
                .value_name("PROJECT")
                .required_if("task-queue-kind", "gcp-pubsub")
                .help("GCP project ID that owns the PubSub topics"),
        )
        .arg(
            Arg::with_name("gcp-pubsub-create-topics")
                .long("gcp-pubsub-create-topics")
                .env("GCP_PUBSUB_CREATE_TOPICS")
                .value_name("BOOL")
                .possible_value("true")
                .possible_value("false")
                .default_value("false")
                .help("Whether to create the PubSub topics at startup (an existing topic is not an error)"),
        )
        .arg(
            Arg::with_name("aws-sns-region")
                .long("aws-sns-region")
                .env("AWS_SNS_REGION")
                .value_name("REGION")
                .required_if("task-queue-kind", "aws-sns")
                .help("AWS region the SNS topics live in"),
        )
        .arg(
            Arg::with_name("aws-sns-identity")
                .long("aws-sns-identity")
                .env("AWS_SNS_IDENTITY")
                .value_name("IAM_ROLE")
                .required_if("task-queue-kind", "aws-sns")
                .help("ARN of the IAM role to assume when publishing to SNS"),
        )
        .arg(
            Arg::with_name("push-gateway")
                .long("push-gateway")
                .env("PUSH_GATEWAY")
                .value_name("HOST")
                .help("Prometheus push gateway that gauges are pushed to on exit"),
        )
        .arg(
            Arg::with_name("dry-run")
                .long("dry-run")
                .env("DRY_RUN")
                .value_name("BOOL")
                .possible_value("true")
                .possible_value("false")
                .default_value("false")
                .help(
                    "If true, tasks are logged instead of published and no \
                    task markers are written. Reads remain real.",
                ),
        )
        .arg(
            Arg::with_name("max-enqueue-workers")
                .long("max-enqueue-workers")
                .env("MAX_ENQUEUE_WORKERS")
                .value_name("INT")
                .default_value("100")
                .validator(num_validator::<usize>)
                .help("Maximum number of concurrent task publishes"),
        )
}

fn main() -> Result<(), anyhow::Error> {
    let matches = app().get_matches();

    let force_json_log_output = value_t!(matches.value_of("force-json-log-output"), bool)?;
    let log_level = &env::var("RUST_LOG")
        .unwrap_or_else(|_| "INFO".to_owned())
        .to_uppercase();
    let (root_logger, _guard) = setup_logging(&LoggingConfiguration {
        force_json_output: force_json_log_output,
        version_string: option_env!("BUILD_INFO").unwrap_or("(BUILD_INFO unavailable)"),
        log_level,
    })?;

    if let Err(error) = run(matches, root_logger) {
        // We cannot return this error out of main to lang_start because
        // certain errors (i.e. from ureq) may attempt to log when they are
        // dropped, but the `slog_scope::GlobalLoggerGuard` will have already
        // been dropped upon return. slog-scope will panic in this case.
        // Instead, we handle displaying the error and returning an error code
        // manually here, while the guard is still alive.
        eprintln!("Error: {:?}", error);
        std::process::exit(1);
    }

    Ok(())
}

fn run(matches: ArgMatches, root_logger: Logger) -> Result<(), anyhow::Error> {
    let args: Vec<String> = std::env::args().collect();
    info!(
        root_logger,
        "starting {}. Args: [{}]",
        args[0],
        args[1..].join(" "),
    );
    let start = Instant::now();

    // The configuration of the Args in app() should guarantee that the
    // various parameters are present and valid, so it is safe to use
    // unwrap() when fetching their values below.
    let k8s_namespace = matches.value_of("k8s-namespace").unwrap();
    let ingestor_label = matches.value_of("ingestor-label").unwrap();
    let push_gateway = matches.value_of("push-gateway");
    let dry_run = value_t!(matches.value_of("dry-run"), bool)?;
    let is_first = value_t!(matches.value_of("is-first"), bool)?;
    let max_enqueue_workers = value_t!(matches.value_of("max-enqueue-workers"), usize)?;
    let intake_max_age =
        DayDuration::from_str(matches.value_of("intake-max-age").unwrap())
            .map_err(|e| anyhow!(e))?
            .to_duration();
    let aggregation_period =
        DayDuration::from_str(matches.value_of("aggregation-period").unwrap())
            .map_err(|e| anyhow!(e))?
            .to_duration();
    let grace_period = DayDuration::from_str(matches.value_of("grace-period").unwrap())
        .map_err(|e| anyhow!(e))?
        .to_duration();

    let api_metrics = ApiClientMetricsCollector::new()?;
    let metrics = WorkflowMetricsCollector::new(k8s_namespace, ingestor_label)?;

    let runtime = runtime::Builder::new_multi_thread().enable_all().build()?;

    // SIGTERM is honored between aggregation IDs, at the next RPC boundary
    let terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&terminate))
        .context("failed to register SIGTERM handler")?;

    let result = schedule_tasks(
        &matches,
        is_first,
        dry_run,
        max_enqueue_workers,
        intake_max_age,
        aggregation_period,
        grace_period,
        &metrics,
        runtime.handle(),
        &api_metrics,
        &terminate,
        &root_logger,
    );

    metrics
        .runtime_seconds
        .set(start.elapsed().as_secs_f64());
    match &result {
        // last_success_seconds is only advanced once every aggregation ID has
        // been processed; errors within a single aggregation ID are logged by
        // the scheduler and do not count as run failures
        Ok(()) => metrics.last_success_seconds.set(Utc::now().timestamp()),
        Err(error) => {
            error!(root_logger, "run failed: {:?}", error);
            metrics.last_failure_seconds.set(Utc::now().timestamp());
        }
    }

    if let Some(push_gateway) = push_gateway {
        if let Err(error) = push_metrics(&root_logger, push_gateway, &api_metrics) {
            error!(root_logger, "failed to push metrics: {:?}", error);
        }
    }

    info!(
        root_logger,
        "run complete in {:.3}s",
        start.elapsed().as_secs_f64()
    );
    result
}

fn schedule_tasks(
    matches: &ArgMatches,
    is_first: bool,
    dry_run: bool,
    max_enqueue_workers: usize,
    intake_max_age: chrono::Duration,
    aggregation_period: chrono::Duration,
    grace_period: chrono::Duration,
    metrics: &WorkflowMetricsCollector,
    runtime_handle: &tokio::runtime::Handle,
    api_metrics: &ApiClientMetricsCollector,
    terminate: &AtomicBool,
    root_logger: &Logger,
) -> Result<()> {
    let intake_bucket = bucket_from_arg(
        matches,
        "ingestor",
        dry_run,
        runtime_handle,
        root_logger,
        api_metrics,
    )?;
    let own_validation_bucket = bucket_from_arg(
        matches,
        "own-validation",
        dry_run,
        runtime_handle,
        root_logger,
        api_metrics,
    )?;
    let peer_validation_bucket = bucket_from_arg(
        matches,
        "peer-validation",
        dry_run,
        runtime_handle,
        root_logger,
        api_metrics,
    )?;

    let intake_topic = matches.value_of("intake-tasks-topic").unwrap();
    let aggregate_topic = matches.value_of("aggregate-tasks-topic").unwrap();
    let (intake_publisher, aggregate_publisher) = task_publishers_from_args(
        matches,
        dry_run,
        intake_topic,
        aggregate_topic,
        runtime_handle,
        root_logger,
        api_metrics,
    )?;

    let intake_enqueuer: TaskEnqueuer<IntakeBatchTask> =
        TaskEnqueuer::new(intake_publisher, max_enqueue_workers, root_logger)?;
    let aggregate_enqueuer: TaskEnqueuer<AggregationTask> =
        TaskEnqueuer::new(aggregate_publisher, max_enqueue_workers, root_logger)?;

    let scheduler = TaskScheduler::new(
        RealClock {},
        intake_bucket,
        own_validation_bucket,
        peer_validation_bucket,
        is_first,
        intake_max_age,
        aggregation_period,
        grace_period,
        metrics.clone(),
        root_logger,
    );

    scheduler.run(intake_enqueuer, aggregate_enqueuer, terminate)
}

fn bucket_from_arg(
    matches: &ArgMatches,
    entity: &str,
    dry_run: bool,
    runtime_handle: &tokio::runtime::Handle,
    logger: &Logger,
    api_metrics: &ApiClientMetricsCollector,
) -> Result<Bucket> {
    let path = StoragePath::from_str(
        matches
            .value_of(format!("{}-input", entity).as_str())
            .unwrap(),
    )?;
    let identity = Identity::from(matches.value_of(format!("{}-identity", entity).as_str()));
    if matches!(path, StoragePath::S3Path(_)) && identity.is_none() {
        return Err(anyhow!(
            "--{}-identity is required for S3 bucket {}",
            entity,
            path
        ));
    }
    Bucket::new(
        &path,
        &identity,
        entity,
        dry_run,
        runtime_handle,
        logger,
        api_metrics,
    )
}

#[allow(clippy::type_complexity)]
fn task_publishers_from_args(
    matches: &ArgMatches,
    dry_run: bool,
    intake_topic: &str,
    aggregate_topic: &str,
    runtime_handle: &tokio::runtime::Handle,
    logger: &Logger,
    api_metrics: &ApiClientMetricsCollector,
) -> Result<(
    Arc<dyn TaskPublisher<IntakeBatchTask>>,
    Arc<dyn TaskPublisher<AggregationTask>>,
)> {
    if dry_run {
        return Ok((
            Arc::new(LoggingPublisher::new(logger, intake_topic)),
            Arc::new(LoggingPublisher::new(logger, aggregate_topic)),
        ));
    }

    let kind = TaskQueueKind::from_str(matches.value_of("task-queue-kind").unwrap())?;
    match kind {
        TaskQueueKind::GcpPubSub => {
            let gcp_project_id = matches.value_of("gcp-project-id").unwrap();
            let create_topics = value_t!(matches.value_of("gcp-pubsub-create-topics"), bool)?;

            let intake_publisher = GcpPubSubTaskPublisher::new(
                None,
                gcp_project_id,
                intake_topic,
                Identity::none(),
                logger,
                api_metrics,
            );
            let aggregate_publisher = GcpPubSubTaskPublisher::new(
                None,
                gcp_project_id,
                aggregate_topic,
                Identity::none(),
                logger,
                api_metrics,
            );
            if create_topics {
                intake_publisher
                    .create_topic()
                    .context("failed to create intake tasks topic")?;
                aggregate_publisher
                    .create_topic()
                    .context("failed to create aggregate tasks topic")?;
            }
            Ok((Arc::new(intake_publisher), Arc::new(aggregate_publisher)))
        }
        TaskQueueKind::AwsSns => {
            let region = matches.value_of("aws-sns-region").unwrap();
            let role_arn = matches.value_of("aws-sns-identity").unwrap();
            let identity = Identity::from(Some(role_arn));
            let credentials_provider = workflow_manager::aws_credentials::Provider::new(
                &identity,
                "task-queue",
                logger,
                api_metrics,
            )
            .context("failed to create AWS credentials provider for SNS")?;

            let intake_publisher = AwsSnsTaskPublisher::new(
                region,
                intake_topic,
                role_arn,
                credentials_provider.clone(),
                runtime_handle,
                logger,
            )?;
            let aggregate_publisher = AwsSnsTaskPublisher::new(
                region,
                aggregate_topic,
                role_arn,
                credentials_provider,
                runtime_handle,
                logger,
            )?;
            Ok((Arc::new(intake_publisher), Arc::new(aggregate_publisher)))
        }
    }
}
