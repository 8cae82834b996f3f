use anyhow::{anyhow, Context, Result};
use derivative::Derivative;
use rusoto_core::Region;
use rusoto_sns::{PublishInput, Sns, SnsClient};
use slog::{info, o, Logger};
use std::str::FromStr;
use tokio::runtime::Handle;

use crate::{
    aws_credentials::{self, is_rusoto_error_retryable},
    logging::event,
    retries::retry_request,
    task::{EnqueueError, Task, TaskPublisher},
};

/// A task publisher backed by AWS SNS. Tasks are serialized as JSON and
/// published to a topic whose ARN is derived from the configured region,
/// topic name and the account of the assumed IAM role.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct AwsSnsTaskPublisher {
    region: Region,
    topic_arn: String,
    runtime_handle: Handle,
    #[derivative(Debug = "ignore")]
    credentials_provider: aws_credentials::Provider,
    logger: Logger,
}

impl AwsSnsTaskPublisher {
    pub fn new(
        region: &str,
        topic: &str,
        role_arn: &str,
        credentials_provider: aws_credentials::Provider,
        runtime_handle: &Handle,
        parent_logger: &Logger,
    ) -> Result<AwsSnsTaskPublisher> {
        let region = Region::from_str(region).context("invalid AWS region")?;
        let topic_arn = derive_topic_arn(&region, role_arn, topic)?;
        Ok(Self::new_with_topic_arn(
            region,
            topic_arn,
            credentials_provider,
            runtime_handle,
            parent_logger,
        ))
    }

    pub(crate) fn new_with_topic_arn(
        region: Region,
        topic_arn: String,
        credentials_provider: aws_credentials::Provider,
        runtime_handle: &Handle,
        parent_logger: &Logger,
    ) -> AwsSnsTaskPublisher {
        let logger = parent_logger.new(o!(
            event::TASK_QUEUE_ID => topic_arn.clone(),
            event::IDENTITY => credentials_provider.to_string(),
        ));
        AwsSnsTaskPublisher {
            region,
            topic_arn,
            runtime_handle: runtime_handle.clone(),
            credentials_provider,
            logger,
        }
    }

    /// Returns a configured SnsClient, or an error on failure.
    fn sns_client(&self) -> Result<SnsClient, EnqueueError> {
        // Rusoto has outstanding issues where either the remote end or the
        // underlying connection pool can close idle connections under us,
        // causing API requests to fail if they are made at the wrong time. In
        // order to avoid having to carefully juggle idle connection timeouts,
        // we create a new SnsClient for each request.
        // https://github.com/rusoto/rusoto/issues/1686
        let http_client = rusoto_core::HttpClient::new()
            .context("failed to create HTTP client")
            .map_err(EnqueueError::SnsClient)?;

        Ok(SnsClient::new_with(
            http_client,
            self.credentials_provider.clone(),
            self.region.clone(),
        ))
    }
}

/// Derives an SNS topic ARN from the region, the account ID embedded in the
/// provided IAM role ARN (e.g. "arn:aws:iam::123456789012:role/fake-role")
/// and the topic name.
fn derive_topic_arn(region: &Region, role_arn: &str, topic: &str) -> Result<String> {
    let account_id = role_arn
        .split(':')
        .nth(4)
        .filter(|account_id| !account_id.is_empty())
        .ok_or_else(|| anyhow!("cannot derive AWS account ID from identity {}", role_arn))?;
    Ok(format!(
        "arn:aws:sns:{}:{}:{}",
        region.name(),
        account_id,
        topic
    ))
}

impl<T: Task> TaskPublisher<T> for AwsSnsTaskPublisher {
    fn publish(&self, task: &T) -> Result<(), EnqueueError> {
        let message = serde_json::to_string(task)?;
        let client = self.sns_client()?;

        retry_request(
            &self.logger.new(o!(event::ACTION => "publish task")),
            || {
                self.runtime_handle.block_on(client.publish(PublishInput {
                    message: message.clone(),
                    topic_arn: Some(self.topic_arn.clone()),
                    ..Default::default()
                }))
            },
            is_rusoto_error_retryable,
        )
        .map_err(EnqueueError::Sns)?;

        info!(self.logger, "published task: {}", task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        logging::setup_test_logging,
        task::IntakeBatchTask,
        test_utils::test_runtime,
    };
    use mockito::{mock, Matcher};

    #[test]
    fn topic_arn_derivation() {
        let arn = derive_topic_arn(
            &Region::UsWest2,
            "arn:aws:iam::123456789012:role/fake-role",
            "intake-tasks",
        )
        .unwrap();
        assert_eq!(arn, "arn:aws:sns:us-west-2:123456789012:intake-tasks");

        derive_topic_arn(&Region::UsWest2, "not-an-arn", "intake-tasks").unwrap_err();
    }

    #[test]
    fn publish_task() {
        let logger = setup_test_logging();
        let runtime = test_runtime();

        let publisher = AwsSnsTaskPublisher::new_with_topic_arn(
            Region::Custom {
                name: "fake-region".into(),
                endpoint: mockito::server_url(),
            },
            "arn:aws:sns:fake-region:123456789012:intake-tasks".to_owned(),
            aws_credentials::Provider::new_mock(),
            runtime.handle(),
            &logger,
        );

        // https://docs.aws.amazon.com/sns/latest/api/API_Publish.html
        let mocked_publish = mock("POST", "/")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("Action=Publish".to_owned()),
                Matcher::Regex("kittens-seen".to_owned()),
            ]))
            .with_body(
                r#"<PublishResponse xmlns="https://sns.amazonaws.com/doc/2010-03-31/">
  <PublishResult><MessageId>fake-message-id</MessageId></PublishResult>
</PublishResponse>"#,
            )
            .expect(1)
            .create();

        let task = IntakeBatchTask {
            aggregation_id: "kittens-seen".to_owned(),
            batch_id: "b8a5579a-f984-460a-a42d-2813cbf57771".to_owned(),
            date: "2020/10/31/20/29".to_owned(),
        };
        publisher.publish(&task).unwrap();

        mocked_publish.assert();
    }
}
