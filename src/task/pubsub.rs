use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use slog::{info, o, Logger};
use std::time::Duration;
use ureq::AgentBuilder;

use crate::{
    config::Identity,
    gcp_oauth::GcpOauthTokenProvider,
    http::{AccessTokenProvider, Method, RequestParameters, RetryingAgent},
    logging::event,
    metrics::ApiClientMetricsCollector,
    parse_url,
    task::{EnqueueError, Task, TaskPublisher},
    Error,
};

const PUBSUB_API_BASE_URL: &str = "https://pubsub.googleapis.com";
const PUBSUB_OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

/// A task publisher backed by Google Cloud PubSub. Tasks are serialized as
/// JSON and published one message at a time; publish returns once the PubSub
/// API has acknowledged the message.
#[derive(Debug)]
pub struct GcpPubSubTaskPublisher {
    pubsub_api_endpoint: String,
    gcp_project_id: String,
    topic_id: String,
    token_provider: Box<dyn AccessTokenProvider>,
    agent: RetryingAgent,
    logger: Logger,
}

impl GcpPubSubTaskPublisher {
    pub fn new(
        pubsub_api_endpoint: Option<&str>,
        gcp_project_id: &str,
        topic_id: &str,
        identity: Identity,
        parent_logger: &Logger,
        api_metrics: &ApiClientMetricsCollector,
    ) -> GcpPubSubTaskPublisher {
        let token_provider = Box::new(GcpOauthTokenProvider::new(
            PUBSUB_OAUTH_SCOPE,
            identity,
            parent_logger,
            api_metrics,
        ));
        Self::new_with_token_provider(
            pubsub_api_endpoint,
            gcp_project_id,
            topic_id,
            token_provider,
            parent_logger,
            api_metrics,
        )
    }

    pub(crate) fn new_with_token_provider(
        pubsub_api_endpoint: Option<&str>,
        gcp_project_id: &str,
        topic_id: &str,
        token_provider: Box<dyn AccessTokenProvider>,
        parent_logger: &Logger,
        api_metrics: &ApiClientMetricsCollector,
    ) -> GcpPubSubTaskPublisher {
        let logger = parent_logger.new(o!(
            "gcp_project_id" => gcp_project_id.to_owned(),
            event::TASK_QUEUE_ID => topic_id.to_owned(),
        ));
        let ureq_agent = AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        // Per Google documentation, 429 Too Many Requests should be retried
        // with exponential backoff
        // https://cloud.google.com/pubsub/docs/reference/error-codes
        let agent = RetryingAgent::new_with_agent(
            ureq_agent,
            vec![429],
            "pubsub.googleapis.com",
            api_metrics,
        );

        GcpPubSubTaskPublisher {
            pubsub_api_endpoint: pubsub_api_endpoint
                .unwrap_or(PUBSUB_API_BASE_URL)
                .to_owned(),
            gcp_project_id: gcp_project_id.to_owned(),
            topic_id: topic_id.to_owned(),
            token_provider,
            agent,
            logger,
        }
    }

    fn topic_path(&self) -> String {
        format!("projects/{}/topics/{}", self.gcp_project_id, self.topic_id)
    }

    /// Creates the topic this publisher publishes to. An already existing
    /// topic (HTTP 409) is success, so every instance may safely attempt
    /// creation at startup.
    /// API reference: https://cloud.google.com/pubsub/docs/reference/rest/v1/projects.topics/create
    pub fn create_topic(&self) -> Result<(), Error> {
        let request = self.agent.prepare_request(RequestParameters {
            url: parse_url(format!(
                "{}/v1/{}",
                self.pubsub_api_endpoint,
                self.topic_path()
            ))?,
            method: Method::Put,
            token_provider: Some(&*self.token_provider),
        })?;

        match self.agent.send_bytes(&self.logger, &request, "topics.create", &[]) {
            Ok(_) => {
                info!(self.logger, "created topic");
                Ok(())
            }
            Err(Error::HttpError(ureq::Error::Status(409, _))) => {
                info!(self.logger, "topic already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl<T: Task> TaskPublisher<T> for GcpPubSubTaskPublisher {
    fn publish(&self, task: &T) -> Result<(), EnqueueError> {
        // The JSON task is encoded as Base64 in the PubSub message
        // https://cloud.google.com/pubsub/docs/reference/rest/v1/projects.topics/publish
        let task_json = serde_json::to_vec(task)?;
        let encoded_task = BASE64_STANDARD.encode(task_json);

        let request = self
            .agent
            .prepare_request(RequestParameters {
                url: parse_url(format!(
                    "{}/v1/{}:publish",
                    self.pubsub_api_endpoint,
                    self.topic_path()
                ))
                .map_err(|e| EnqueueError::PubSub(e.into()))?,
                method: Method::Post,
                token_provider: Some(&*self.token_provider),
            })
            .map_err(EnqueueError::PubSub)?;

        self.agent
            .send_json_request(
                &self.logger,
                &request,
                "topics.publish",
                &ureq::json!({
                    "messages": [{ "data": encoded_task }]
                }),
            )
            .map_err(EnqueueError::PubSub)?;

        info!(self.logger, "published task: {}", task);
        Ok(())
    }
}
