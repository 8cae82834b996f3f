use derivative::Derivative;
use rusoto_core::RusotoError;
use rusoto_s3::{
    ListObjectsV2Error, ListObjectsV2Request, PutObjectError, PutObjectRequest, S3Client, S3,
};
use slog::{info, o, Logger};
use std::time::Duration;
use tokio::runtime::Handle;

use crate::{
    aws_credentials::{self, is_rusoto_error_retryable},
    config::S3Path,
    logging::event,
    retries::retry_request,
    storage::{ObjectStore, StorageError},
};

/// Errors encountered while using S3 as an object store.
#[derive(Debug, thiserror::Error)]
pub enum S3Error {
    #[error("error listing S3 objects in {1}: {0}")]
    ListObjects(#[source] RusotoError<ListObjectsV2Error>, String),
    #[error("error creating S3 object {1}: {0}")]
    PutObject(#[source] RusotoError<PutObjectError>, String),
    #[error("listing of {0} was truncated but no continuation token was provided")]
    MissingContinuationToken(String),
}

/// An ObjectStore backed by an Amazon S3 bucket.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct S3ObjectStore {
    path: S3Path,
    runtime_handle: Handle,
    #[derivative(Debug = "ignore")]
    credentials_provider: aws_credentials::Provider,
    logger: Logger,
}

impl S3ObjectStore {
    pub fn new(
        path: S3Path,
        credentials_provider: aws_credentials::Provider,
        runtime_handle: &Handle,
        parent_logger: &Logger,
    ) -> S3ObjectStore {
        let logger = parent_logger.new(o!(
            event::STORAGE_PATH => path.to_string(),
            event::IDENTITY => credentials_provider.to_string(),
        ));
        S3ObjectStore {
            path: path.ensure_directory_prefix(),
            runtime_handle: runtime_handle.clone(),
            credentials_provider,
            logger,
        }
    }

    /// Constructs an S3Client for this store.
    fn client(&self) -> S3Client {
        // Rusoto uses Hyper which uses connection pools. The default timeout
        // for those connections is 90 seconds[1]. Amazon S3's API closes idle
        // client connections after 20 seconds[2]. If we use a default client
        // via S3Client::new, this mismatch causes requests to fail when Hyper
        // tries to re-use a connection that has been idle too long. Until
        // this is fixed in Rusoto[3], we construct our own HTTP request
        // dispatcher whose underlying hyper::Client is configured to timeout
        // idle connections after 10 seconds.
        //
        // [1]: https://docs.rs/hyper/0.13.8/hyper/client/struct.Builder.html#method.pool_idle_timeout
        // [2]: https://aws.amazon.com/premiumsupport/knowledge-center/s3-socket-connection-timeout-error/
        // [3]: https://github.com/rusoto/rusoto/issues/1686
        let mut builder = hyper::Client::builder();
        builder.pool_idle_timeout(Duration::from_secs(10));
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            // We connect over HTTP in tests and so must allow either protocol
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let http_client = rusoto_core::HttpClient::from_builder(builder, connector);

        S3Client::new_with(
            http_client,
            self.credentials_provider.clone(),
            self.path.region.clone(),
        )
    }

    /// Performs a ListObjectsV2 request, following continuation tokens until
    /// the listing is exhausted, and hands each page's output to `collect`.
    fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        mut collect: impl FnMut(&rusoto_s3::ListObjectsV2Output),
    ) -> Result<(), StorageError> {
        let client = self.client();
        let full_prefix = [&self.path.key, prefix].concat();

        let mut continuation_token: Option<String> = None;
        loop {
            let result = retry_request(
                &self.logger.new(o!(event::ACTION => "list objects")),
                || {
                    self.runtime_handle
                        .block_on(client.list_objects_v2(ListObjectsV2Request {
                            bucket: self.path.bucket.clone(),
                            prefix: Some(full_prefix.clone()),
                            delimiter: delimiter.map(ToOwned::to_owned),
                            // S3 caps listings at 1,000 keys per page
                            max_keys: Some(1000),
                            continuation_token: continuation_token.clone(),
                            ..Default::default()
                        }))
                },
                is_rusoto_error_retryable,
            );
            let output = match result {
                Ok(output) => output,
                // A listing of a bucket that does not exist is an empty
                // listing, not an error
                Err(RusotoError::Service(ListObjectsV2Error::NoSuchBucket(_))) => return Ok(()),
                Err(e) => return Err(S3Error::ListObjects(e, self.path.to_string()).into()),
            };

            collect(&output);

            if output.is_truncated == Some(true) {
                continuation_token = Some(output.next_continuation_token.ok_or_else(|| {
                    S3Error::MissingContinuationToken(self.path.to_string())
                })?);
            } else {
                return Ok(());
            }
        }
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.path.key.as_str()).unwrap_or(key)
    }
}

impl ObjectStore for S3ObjectStore {
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        info!(
            self.logger, "listing S3 objects";
            "prefix" => prefix,
        );
        let mut keys = Vec::new();
        self.list(prefix, None, |output| {
            for object in output.contents.iter().flatten() {
                if let Some(key) = &object.key {
                    keys.push(self.relative_key(key).to_owned());
                }
            }
        })?;
        Ok(keys)
    }

    fn list_prefixes(&self) -> Result<Vec<String>, StorageError> {
        let mut prefixes = Vec::new();
        self.list("", Some("/"), |output| {
            for common_prefix in output.common_prefixes.iter().flatten() {
                if let Some(prefix) = &common_prefix.prefix {
                    prefixes.push(self.relative_key(prefix).to_owned());
                }
            }
        })?;
        Ok(prefixes)
    }

    fn put_empty_object(&self, key: &str) -> Result<(), StorageError> {
        let client = self.client();
        let full_key = [&self.path.key, key].concat();

        retry_request(
            &self.logger.new(o!(event::ACTION => "put object")),
            || {
                self.runtime_handle
                    .block_on(client.put_object(PutObjectRequest {
                        bucket: self.path.bucket.clone(),
                        key: full_key.clone(),
                        body: Some(Vec::new().into()),
                        ..Default::default()
                    }))
            },
            is_rusoto_error_retryable,
        )
        .map_err(|e| S3Error::PutObject(e, full_key.clone()))?;
        Ok(())
    }

    fn path(&self) -> String {
        self.path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logging::setup_test_logging, test_utils::test_runtime};
    use mockito::{mock, Matcher};
    use rusoto_core::Region;

    const TEST_BUCKET: &str = "fake-bucket";
    const TEST_REGION: &str = "fake-region";

    fn test_store(runtime_handle: &Handle) -> S3ObjectStore {
        let logger = setup_test_logging();
        S3ObjectStore::new(
            S3Path {
                region: Region::Custom {
                    name: TEST_REGION.into(),
                    endpoint: mockito::server_url(),
                },
                bucket: TEST_BUCKET.into(),
                key: "".into(),
            },
            aws_credentials::Provider::new_mock(),
            runtime_handle,
            &logger,
        )
    }

    #[test]
    fn list_objects_across_pages() {
        let runtime = test_runtime();
        let store = test_store(runtime.handle());

        // https://docs.aws.amazon.com/AmazonS3/latest/API/API_ListObjectsV2.html
        let first_page = mock("GET", format!("/{}", TEST_BUCKET).as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("list-type".to_owned(), "2".to_owned()),
                Matcher::UrlEncoded("prefix".to_owned(), "kittens-seen/".to_owned()),
            ]))
            .with_body(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
   <Name>fake-bucket</Name>
   <IsTruncated>true</IsTruncated>
   <NextContinuationToken>fake-continuation-token</NextContinuationToken>
   <Contents><Key>kittens-seen/first.batch</Key></Contents>
</ListBucketResult>"#,
            )
            .expect(1)
            .create();

        let second_page = mock("GET", format!("/{}", TEST_BUCKET).as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("list-type".to_owned(), "2".to_owned()),
                Matcher::UrlEncoded(
                    "continuation-token".to_owned(),
                    "fake-continuation-token".to_owned(),
                ),
            ]))
            .with_body(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
   <Name>fake-bucket</Name>
   <IsTruncated>false</IsTruncated>
   <Contents><Key>kittens-seen/second.batch</Key></Contents>
</ListBucketResult>"#,
            )
            .expect(1)
            .create();

        let keys = store.list_objects("kittens-seen/").unwrap();
        assert_eq!(
            keys,
            vec![
                "kittens-seen/first.batch".to_owned(),
                "kittens-seen/second.batch".to_owned(),
            ]
        );

        first_page.assert();
        second_page.assert();
    }

    #[test]
    fn list_prefixes() {
        let runtime = test_runtime();
        let store = test_store(runtime.handle());

        let mocked_get = mock("GET", format!("/{}", TEST_BUCKET).as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("list-type".to_owned(), "2".to_owned()),
                Matcher::UrlEncoded("delimiter".to_owned(), "/".to_owned()),
            ]))
            .with_body(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
   <Name>fake-bucket</Name>
   <IsTruncated>false</IsTruncated>
   <CommonPrefixes><Prefix>kittens-seen/</Prefix></CommonPrefixes>
   <CommonPrefixes><Prefix>task-markers/</Prefix></CommonPrefixes>
</ListBucketResult>"#,
            )
            .create();

        assert_eq!(
            store.list_prefixes().unwrap(),
            vec!["kittens-seen/".to_owned(), "task-markers/".to_owned()]
        );

        mocked_get.assert();
    }

    #[test]
    fn put_empty_object() {
        let runtime = test_runtime();
        let store = test_store(runtime.handle());

        let mocked_put = mock(
            "PUT",
            format!("/{}/task-markers/intake-kittens-seen-fake-uuid", TEST_BUCKET).as_str(),
        )
        .with_status(200)
        .create();

        store
            .put_empty_object("task-markers/intake-kittens-seen-fake-uuid")
            .unwrap();

        mocked_put.assert();
    }
}
