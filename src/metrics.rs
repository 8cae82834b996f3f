use anyhow::{anyhow, Context, Result};
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_gauge_vec, Encoder, Gauge,
    HistogramVec, IntGauge, TextEncoder,
};
use slog::{info, Logger};

use crate::{
    http::{Method, RequestParameters, RetryingAgent},
    parse_url,
};

/// A collector for metrics about API clients, used by all the HTTP clients in
/// this crate.
#[derive(Clone, Debug)]
pub struct ApiClientMetricsCollector {
    pub latency: HistogramVec,
}

impl ApiClientMetricsCollector {
    pub fn new() -> Result<ApiClientMetricsCollector> {
        Self::new_with_metric_name("workflow_manager")
    }

    /// Creates a collector whose metric name is prefixed with the provided
    /// value. Registering the same metric name twice in the default registry
    /// fails, so tests use distinct prefixes.
    pub fn new_with_metric_name(name: &str) -> Result<ApiClientMetricsCollector> {
        let latency = register_histogram_vec!(
            format!("{}_api_client_latency_ms", name),
            "Latency of API client requests, in milliseconds",
            &["service", "endpoint", "http_status"]
        )
        .context("failed to register API client latency histogram")?;

        Ok(ApiClientMetricsCollector { latency })
    }
}

/// The gauges this process pushes on exit. All of them are labeled with the
/// Kubernetes namespace and the ingestor this instance schedules work for,
/// with label values resolved once at construction.
#[derive(Clone, Debug)]
pub struct WorkflowMetricsCollector {
    pub intake_tasks_scheduled: IntGauge,
    pub intake_tasks_skipped_due_to_marker: IntGauge,
    pub aggregate_tasks_scheduled: IntGauge,
    pub aggregate_tasks_skipped_due_to_marker: IntGauge,
    pub last_success_seconds: IntGauge,
    pub last_failure_seconds: IntGauge,
    pub runtime_seconds: Gauge,
}

impl WorkflowMetricsCollector {
    pub fn new(k8s_namespace: &str, ingestor_label: &str) -> Result<WorkflowMetricsCollector> {
        Self::new_with_metric_name("workflow_manager", k8s_namespace, ingestor_label)
    }

    pub fn new_with_metric_name(
        name: &str,
        k8s_namespace: &str,
        ingestor_label: &str,
    ) -> Result<WorkflowMetricsCollector> {
        const LABELS: &[&str] = &["k8s_namespace", "ingestor"];
        let label_values = &[k8s_namespace, ingestor_label];

        let intake_tasks_scheduled = register_int_gauge_vec!(
            format!("{}_intake_tasks_scheduled", name),
            "Number of intake-batch tasks scheduled during the last run",
            LABELS
        )
        .context("failed to register gauge for scheduled intake tasks")?
        .with_label_values(label_values);

        let intake_tasks_skipped_due_to_marker = register_int_gauge_vec!(
            format!("{}_intake_tasks_skipped_due_to_marker", name),
            "Number of intake-batch tasks skipped because a task marker was found",
            LABELS
        )
        .context("failed to register gauge for skipped intake tasks")?
        .with_label_values(label_values);

        let aggregate_tasks_scheduled = register_int_gauge_vec!(
            format!("{}_aggregate_tasks_scheduled", name),
            "Number of aggregate tasks scheduled during the last run",
            LABELS
        )
        .context("failed to register gauge for scheduled aggregate tasks")?
        .with_label_values(label_values);

        let aggregate_tasks_skipped_due_to_marker = register_int_gauge_vec!(
            format!("{}_aggregate_tasks_skipped_due_to_marker", name),
            "Number of aggregate tasks skipped because a task marker was found",
            LABELS
        )
        .context("failed to register gauge for skipped aggregate tasks")?
        .with_label_values(label_values);

        let last_success_seconds = register_int_gauge_vec!(
            format!("{}_last_success_seconds", name),
            "Unix timestamp of the last wholly successful run",
            LABELS
        )
        .context("failed to register gauge for last success")?
        .with_label_values(label_values);

        let last_failure_seconds = register_int_gauge_vec!(
            format!("{}_last_failure_seconds", name),
            "Unix timestamp of the last failed run",
            LABELS
        )
        .context("failed to register gauge for last failure")?
        .with_label_values(label_values);

        let runtime_seconds = register_gauge_vec!(
            format!("{}_runtime_seconds", name),
            "Duration of the last run, in seconds",
            LABELS
        )
        .context("failed to register gauge for runtime")?
        .with_label_values(label_values);

        Ok(WorkflowMetricsCollector {
            intake_tasks_scheduled,
            intake_tasks_skipped_due_to_marker,
            aggregate_tasks_scheduled,
            aggregate_tasks_skipped_due_to_marker,
            last_success_seconds,
            last_failure_seconds,
            runtime_seconds,
        })
    }
}

/// Pushes everything in the default Prometheus registry to the provided push
/// gateway using the text exposition format. This process runs on a cron
/// cadence and exits, so it pushes its gauges once on the way out instead of
/// exposing a scrape endpoint.
pub fn push_metrics(
    logger: &Logger,
    push_gateway: &str,
    api_metrics: &ApiClientMetricsCollector,
) -> Result<()> {
    let address = if push_gateway.starts_with("http://") || push_gateway.starts_with("https://") {
        push_gateway.to_owned()
    } else {
        format!("http://{}", push_gateway)
    };
    let url = parse_url(format!("{}/metrics/job/workflow-manager", address))
        .context("failed to construct push gateway URL")?;

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .context("failed to encode metrics")?;

    let agent = RetryingAgent::new("push-gateway", api_metrics);
    let request = agent
        .prepare_request(RequestParameters {
            url,
            method: Method::Put,
            token_provider: None,
        })
        .map_err(|e| anyhow!("failed to prepare push gateway request: {}", e))?
        // https://github.com/prometheus/docs/blob/master/content/docs/instrumenting/exposition_formats.md
        .set("Content-Type", "text/plain; version=0.0.4");

    agent
        .send_bytes(logger, &request, "push", &buffer)
        .map_err(|e| anyhow!("failed to push metrics: {}", e))?;

    info!(logger, "pushed metrics to push gateway");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use mockito::mock;

    #[test]
    fn gauges_register_and_update() {
        let collector = WorkflowMetricsCollector::new_with_metric_name(
            "gauges_register_and_update",
            "fake-namespace",
            "fake-ingestor",
        )
        .unwrap();

        collector.intake_tasks_scheduled.inc();
        collector.intake_tasks_scheduled.inc();
        collector.intake_tasks_skipped_due_to_marker.inc();
        assert_eq!(collector.intake_tasks_scheduled.get(), 2);
        assert_eq!(collector.intake_tasks_skipped_due_to_marker.get(), 1);
        assert_eq!(collector.aggregate_tasks_scheduled.get(), 0);
    }

    #[test]
    fn push_to_gateway() {
        let logger = setup_test_logging();
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name("push_to_gateway").unwrap();

        let mocked_put = mock("PUT", "/metrics/job/workflow-manager")
            .match_header("Content-Type", "text/plain; version=0.0.4")
            .with_status(200)
            .create();

        push_metrics(&logger, &mockito::server_url(), &api_metrics).unwrap();

        mocked_put.assert();
    }
}
