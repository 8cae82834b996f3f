use anyhow::{anyhow, Context, Result};
use atty::{self, Stream};
use slog::{o, Drain, FnValue, Level, LevelFilter, Logger, PushFnValue};
use slog_json::Json;
use slog_scope::GlobalLoggerGuard;
use slog_term::{FullFormat, PlainSyncDecorator, TermDecorator, TestStdoutWriter};
use std::{
    io::{self, stderr, Stderr},
    str::FromStr,
    thread,
};
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// `event` defines constants for structured events
pub mod event {
    /// An event key is a key that could be encountered in the fields of a
    /// structured log message.
    type EventKey = &'static str;

    /// The ID of the aggregation being scheduled
    pub(crate) const AGGREGATION_ID: EventKey = "aggregation_id";
    /// The ID (a UUID) of a batch that something happened to
    pub(crate) const BATCH_ID: EventKey = "batch_id";
    /// The date of a batch that something happened to
    pub(crate) const BATCH_DATE: EventKey = "batch_date";
    /// The path to some object store (e.g., an S3 bucket or a GCS bucket)
    pub(crate) const STORAGE_PATH: EventKey = "path";
    /// The key for an object in some object store
    pub(crate) const STORAGE_KEY: EventKey = "key";
    /// An identity used while accessing some cloud resource (e.g., an AWS
    /// role ARN or a GCP service account email)
    pub(crate) const IDENTITY: EventKey = "identity";
    /// The name of a task marker
    pub(crate) const TASK_MARKER: EventKey = "task_marker";
    /// Unique identifier for a task queue topic
    pub(crate) const TASK_QUEUE_ID: EventKey = "task_queue_id";
    /// A half-open interval of time bounding some listing or window
    pub(crate) const INTERVAL: EventKey = "interval";
    /// Description of an action being retried
    pub(crate) const ACTION: EventKey = "action";
}

/// The Cloud Logging severity corresponding to an slog level, attached to
/// JSON log records so the logging agent classifies them correctly.
/// https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry#LogSeverity
fn severity(level: Level) -> &'static str {
    match level {
        Level::Critical => "CRITICAL",
        Level::Error => "ERROR",
        Level::Warning => "WARNING",
        Level::Info => "INFO",
        Level::Debug | Level::Trace => "DEBUG",
    }
}

/// Options for configuring logging in this application
pub struct LoggingConfiguration<'a> {
    /// Force [slog-json][1] output even when stderr is a tty. By default,
    /// JSON formatting is used when stderr is not a tty, and a [slog-term][2]
    /// pretty-printer otherwise.
    ///
    /// [1]: https://docs.rs/slog-json
    /// [2]: https://docs.rs/slog-term
    pub force_json_output: bool,
    /// A version string attached to every log record
    pub version_string: &'a str,
    /// Records above this log level are discarded
    pub log_level: &'a str,
}

/// The two stderr drains we construct do not share a type, so boxing one
/// requires a common supertrait.
trait StderrDrain: Drain<Ok = (), Err = io::Error> + Send {}

impl StderrDrain for Json<Stderr> {}
impl StderrDrain for FullFormat<TermDecorator> {}

fn stderr_drain(json_output: bool) -> Box<dyn StderrDrain> {
    if json_output {
        // slog-json's default keys for the timestamp, level and message are
        // replaced with the names the Cloud Logging agent expects
        // https://cloud.google.com/logging/docs/agent/configuration#process-payload
        let drain = Json::new(stderr())
            .set_newlines(true)
            .add_key_value(o!(
                "time" => FnValue(|_| {
                    chrono::Local::now().to_rfc3339()
                }),
                "severity" => FnValue(|record| {
                    severity(record.level())
                }),
                "message" => PushFnValue(|record, serializer| {
                    serializer.emit(record.msg())
                }),
            ))
            .build();
        Box::new(drain)
    } else {
        let decorator = TermDecorator::new().stderr().build();
        Box::new(FullFormat::new(decorator).build())
    }
}

/// Initializes logging resources. On success, returns the root
/// [`slog::Logger`][1], from which modules should create child loggers
/// carrying their own key-value pairs, and a
/// [`slog_scope::GlobalLoggerGuard`] that the caller must keep live for the
/// lifetime of the process. Returns an error if the `LoggingConfiguration` is
/// invalid or if a global logging hook cannot be installed.
///
/// [1]: https://docs.rs/slog/2.7.0/slog/struct.Logger.html
pub fn setup_logging(config: &LoggingConfiguration) -> Result<(Logger, GlobalLoggerGuard)> {
    // Assume that a non-tty stderr means we are running in a cloud, where the
    // logging agent wants JSON
    let json_output = atty::isnt(Stream::Stderr) || config.force_json_output;

    let log_level = Level::from_str(config.log_level)
        .map_err(|_| anyhow!("{} is not a valid log level", config.log_level))?;
    let drain = LevelFilter::new(stderr_drain(json_output), log_level);

    // slog-async makes it safe to clone loggers across threads
    let drain = slog_async::Async::new(drain.fuse()).build().fuse();
    let root_logger = Logger::root(
        drain,
        o!(
            "version" => config.version_string.to_owned(),
            "module" => FnValue(|record| {
                record.module()
            }),
            "file" => FnValue(|record| {
                record.file()
            }),
            "line" => FnValue(|record| {
                record.line()
            }),
            "thread_id" => FnValue(|_| {
                format!("{:?}", thread::current().id())
            })
        ),
    );

    // Register the root logger globally, and bridge the `log` crate so that
    // records from dependencies like rusoto are captured too
    let scope_guard = slog_scope::set_global_logger(root_logger.clone());
    slog_stdlog::init().context("failed to initialize slog as log backend")?;

    // tokio and hyper emit `tracing` events rather than `log` records, so a
    // tracing subscriber is installed as well. It is filtered through the
    // RUST_LOG environment variable:
    // https://docs.rs/tracing-subscriber/0.2.20/tracing_subscriber/filter/struct.EnvFilter.html
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_level(true)
        .with_target(true);

    let fmt_layer: Box<dyn tracing_subscriber::layer::Layer<_> + Send + Sync> = if json_output {
        Box::new(fmt_layer.json())
    } else {
        Box::new(fmt_layer.pretty())
    };

    let subscriber = Registry::default()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default());

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    Ok((root_logger, scope_guard))
}

/// Initialize logging for unit or integration tests. Must be public for
/// visibility in integration tests.
pub fn setup_test_logging() -> Logger {
    let decorator = PlainSyncDecorator::new(TestStdoutWriter);
    let drain = FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping() {
        assert_eq!(severity(Level::Critical), "CRITICAL");
        assert_eq!(severity(Level::Error), "ERROR");
        assert_eq!(severity(Level::Warning), "WARNING");
        assert_eq!(severity(Level::Info), "INFO");
        // Cloud Logging has no TRACE severity, so both map to DEBUG
        assert_eq!(severity(Level::Debug), "DEBUG");
        assert_eq!(severity(Level::Trace), "DEBUG");
    }
}
