use serde::Deserialize;
use slog::{info, o, Logger};

use crate::{
    config::{GCSPath, Identity},
    gcp_oauth::GcpOauthTokenProvider,
    http::{AccessTokenProvider, Method, RequestParameters, RetryingAgent},
    logging::event,
    metrics::ApiClientMetricsCollector,
    parse_url,
    storage::{ObjectStore, StorageError},
    Error, UrlParseError,
};

const DEFAULT_STORAGE_API_BASE_URL: &str = "https://storage.googleapis.com";
const STORAGE_OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
// The GCS API caps listings at 1,000 objects per page
// https://cloud.google.com/storage/docs/json_api/v1/objects/list
const MAX_RESULTS_PER_PAGE: &str = "1000";

/// Errors encountered while using GCS as an object store.
#[derive(Debug, thiserror::Error)]
pub enum GcsError {
    #[error("invalid GCS API URL: {0}")]
    Url(#[from] UrlParseError),
    #[error("error listing objects in {1}: {0}")]
    List(#[source] Error, String),
    #[error("failed to deserialize response from GCS API: {0}")]
    BadListResponse(#[source] std::io::Error),
    #[error("error creating object {1}: {0}")]
    PutObject(#[source] Error, String),
}

/// The portion of the response to an objects.list request that we are
/// interested in.
/// https://cloud.google.com/storage/docs/json_api/v1/objects/list#response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ObjectMetadata>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectMetadata {
    name: String,
}

/// An ObjectStore backed by a Google Cloud Storage bucket, accessed via the
/// JSON API with Oauth tokens obtained from the GKE metadata service (or by
/// impersonating the configured service account).
#[derive(Clone, Debug)]
pub struct GcsObjectStore {
    path: GCSPath,
    storage_api_base_url: String,
    token_provider: Box<dyn AccessTokenProvider>,
    agent: RetryingAgent,
    logger: Logger,
}

impl GcsObjectStore {
    pub fn new(
        path: GCSPath,
        identity: Identity,
        parent_logger: &Logger,
        api_metrics: &ApiClientMetricsCollector,
    ) -> GcsObjectStore {
        let token_provider = Box::new(GcpOauthTokenProvider::new(
            STORAGE_OAUTH_SCOPE,
            identity,
            parent_logger,
            api_metrics,
        ));
        Self::new_with_api_url(
            path,
            token_provider,
            DEFAULT_STORAGE_API_BASE_URL,
            parent_logger,
            api_metrics,
        )
    }

    /// Creates a store that talks to the storage API at the provided base
    /// URL, with the provided token provider. Tests use this with a mock
    /// server and a static token.
    pub(crate) fn new_with_api_url(
        path: GCSPath,
        token_provider: Box<dyn AccessTokenProvider>,
        storage_api_base_url: &str,
        parent_logger: &Logger,
        api_metrics: &ApiClientMetricsCollector,
    ) -> GcsObjectStore {
        let logger = parent_logger.new(o!(
            event::STORAGE_PATH => path.to_string(),
        ));
        GcsObjectStore {
            path: path.ensure_directory_prefix(),
            storage_api_base_url: storage_api_base_url.to_owned(),
            token_provider,
            agent: RetryingAgent::new("storage.googleapis.com", api_metrics),
            logger,
        }
    }

    /// Performs an objects.list request, following page tokens until the
    /// listing is exhausted. When a delimiter is provided, the API rolls
    /// object keys up into distinct prefixes.
    fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<ListResponse, StorageError> {
        let url = parse_url(format!(
            "{}/storage/v1/b/{}/o",
            self.storage_api_base_url, self.path.bucket
        ))
        .map_err(GcsError::Url)?;
        let full_prefix = [&self.path.key, prefix].concat();

        let mut items = Vec::new();
        let mut prefixes = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .agent
                .prepare_request(RequestParameters {
                    url: url.clone(),
                    method: Method::Get,
                    token_provider: Some(&*self.token_provider),
                })
                .map_err(|e| GcsError::List(e, self.path.to_string()))?
                .query("maxResults", MAX_RESULTS_PER_PAGE)
                .query("prefix", &full_prefix);
            if let Some(delimiter) = delimiter {
                request = request.query("delimiter", delimiter);
            }
            if let Some(token) = &page_token {
                request = request.query("pageToken", token);
            }

            let response = match self.agent.call(&self.logger, &request, "objects.list") {
                Ok(response) => response,
                // A listing of a bucket or prefix that does not exist is an
                // empty listing, not an error
                Err(Error::HttpError(ureq::Error::Status(404, _))) => break,
                Err(e) => return Err(GcsError::List(e, self.path.to_string()).into()),
            };

            let page: ListResponse = response
                .into_json()
                .map_err(GcsError::BadListResponse)?;
            items.extend(page.items);
            prefixes.extend(page.prefixes);

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(ListResponse {
            items,
            prefixes,
            next_page_token: None,
        })
    }

    /// Strips this store's key prefix from a bucket-absolute name, yielding
    /// the store-relative key.
    fn relative_key<'a>(&self, name: &'a str) -> &'a str {
        name.strip_prefix(self.path.key.as_str()).unwrap_or(name)
    }
}

impl ObjectStore for GcsObjectStore {
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        info!(
            self.logger, "listing GCS objects";
            "prefix" => prefix,
        );
        let response = self.list(prefix, None)?;
        Ok(response
            .items
            .iter()
            .map(|object| self.relative_key(&object.name).to_owned())
            .collect())
    }

    fn list_prefixes(&self) -> Result<Vec<String>, StorageError> {
        let response = self.list("", Some("/"))?;
        Ok(response
            .prefixes
            .iter()
            .map(|prefix| self.relative_key(prefix).to_owned())
            .collect())
    }

    fn put_empty_object(&self, key: &str) -> Result<(), StorageError> {
        let full_key = [&self.path.key, key].concat();
        // A simple media upload suffices for a zero-length object
        // https://cloud.google.com/storage/docs/uploading-objects
        let url = parse_url(format!(
            "{}/upload/storage/v1/b/{}/o",
            self.storage_api_base_url, self.path.bucket
        ))
        .map_err(GcsError::Url)?;

        let request = self
            .agent
            .prepare_request(RequestParameters {
                url,
                method: Method::Post,
                token_provider: Some(&*self.token_provider),
            })
            .map_err(|e| GcsError::PutObject(e, full_key.clone()))?
            .query("uploadType", "media")
            .query("name", &full_key);

        self.agent
            .send_bytes(&self.logger, &request, "objects.insert", &[])
            .map_err(|e| GcsError::PutObject(e, full_key))?;
        Ok(())
    }

    fn path(&self) -> String {
        self.path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{http::StaticAccessTokenProvider, logging::setup_test_logging};
    use mockito::{mock, Matcher};
    use std::str::FromStr;

    fn test_store(name: &str) -> GcsObjectStore {
        let logger = setup_test_logging();
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name(name).unwrap();
        GcsObjectStore::new_with_api_url(
            GCSPath::from_str("gs://fake-bucket").unwrap(),
            Box::new(StaticAccessTokenProvider::from("fake-token".to_string())),
            &mockito::server_url(),
            &logger,
            &api_metrics,
        )
    }

    #[test]
    fn list_objects_across_pages() {
        let store = test_store("gcs_list_objects_across_pages");

        let first_page = mock("GET", "/storage/v1/b/fake-bucket/o")
            .match_header("Authorization", "Bearer fake-token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("prefix".to_owned(), "kittens-seen/".to_owned()),
                Matcher::UrlEncoded("maxResults".to_owned(), "1000".to_owned()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"items": [{"name": "kittens-seen/first.batch"}], "nextPageToken": "fake-page-token"}"#,
            )
            .expect(1)
            .create();

        let second_page = mock("GET", "/storage/v1/b/fake-bucket/o")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("prefix".to_owned(), "kittens-seen/".to_owned()),
                Matcher::UrlEncoded("pageToken".to_owned(), "fake-page-token".to_owned()),
            ]))
            .with_status(200)
            .with_body(r#"{"items": [{"name": "kittens-seen/second.batch"}]}"#)
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
    fn list_objects_not_found_is_empty() {
        let store = test_store("gcs_list_objects_not_found_is_empty");

        let mocked_get = mock("GET", "/storage/v1/b/fake-bucket/o")
            .with_status(404)
            .create();

        assert!(store.list_objects("kittens-seen/").unwrap().is_empty());

        mocked_get.assert();
    }

    #[test]
    fn list_prefixes() {
        let store = test_store("gcs_list_prefixes");

        let mocked_get = mock("GET", "/storage/v1/b/fake-bucket/o")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("delimiter".to_owned(), "/".to_owned()),
                Matcher::UrlEncoded("prefix".to_owned(), "".to_owned()),
            ]))
            .with_status(200)
            .with_body(r#"{"prefixes": ["kittens-seen/", "task-markers/"]}"#)
            .create();

        assert_eq!(
            store.list_prefixes().unwrap(),
            vec!["kittens-seen/".to_owned(), "task-markers/".to_owned()]
        );

        mocked_get.assert();
    }

    #[test]
    fn put_empty_object() {
        let store = test_store("gcs_put_empty_object");

        let mocked_post = mock("POST", "/upload/storage/v1/b/fake-bucket/o")
            .match_header("Authorization", "Bearer fake-token")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("uploadType".to_owned(), "media".to_owned()),
                Matcher::UrlEncoded(
                    "name".to_owned(),
                    "task-markers/intake-kittens-seen-fake-uuid".to_owned(),
                ),
            ]))
            .with_status(200)
            .with_body(r#"{"name": "task-markers/intake-kittens-seen-fake-uuid"}"#)
            .create();

        store
            .put_empty_object("task-markers/intake-kittens-seen-fake-uuid")
            .unwrap();

        mocked_post.assert();
    }
}
