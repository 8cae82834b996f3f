//! API clients for obtaining authentication tokens for use with Google Cloud
//! Platform.
//!
//! This binary always runs as a Google Kubernetes Engine workload, so tokens
//! for the default service account come from the GKE metadata service. When a
//! bucket or topic belongs to a different service account, the default
//! account impersonates it through the IAM credentials API. We make reference
//! to _access_ and _identity_ tokens: both are Oauth tokens, but access
//! tokens authenticate to GCP services while identity tokens encode the
//! workload's identity for federation with external services (i.e.
//! `sts.amazonaws.com`).

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use slog::{debug, o, Logger};
use std::{
    fmt::{self, Debug, Formatter},
    sync::{Arc, RwLock},
};

use crate::{
    config::Identity,
    http::{AccessTokenProvider, Method, RequestParameters, RetryingAgent},
    logging::event,
    metrics::ApiClientMetricsCollector,
    parse_url, Error,
};

const DEFAULT_METADATA_BASE_URL: &str = "http://metadata.google.internal:80";
const ACCESS_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const IDENTITY_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/identity";
const DEFAULT_IAM_BASE_URL: &str = "https://iamcredentials.googleapis.com";

/// A wrapper around an access token and its expiration date.
#[derive(Clone)]
struct AccessToken {
    token: String,
    expiration: DateTime<Utc>,
}

impl AccessToken {
    /// Returns true if the token is expired or will expire within the next
    /// ten seconds, leaving room for the request it authenticates to reach
    /// the server.
    fn expired(&self) -> bool {
        Utc::now() >= self.expiration - Duration::seconds(10)
    }
}

/// Represents the response from a GET request to the GKE metadata service's
/// service account token endpoint.
#[derive(Debug, Deserialize, PartialEq)]
struct MetadataServiceTokenResponse {
    access_token: String,
    expires_in: i64,
    token_type: String,
}

/// Represents the response from a POST request to the GCP IAM service's
/// generateAccessToken endpoint.
/// https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateAccessToken
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: DateTime<Utc>,
}

/// GcpOauthTokenProvider manages a default service account Oauth token (i.e.
/// the one for a GCP service account mapped to a Kubernetes service account)
/// and, if an account to impersonate was provided, an Oauth token used to
/// impersonate that account. Clones share the underlying token cache, so a
/// provider may be handed to multiple clients of the same scope.
#[derive(Clone)]
pub struct GcpOauthTokenProvider {
    /// The Oauth scope for which tokens are requested.
    scope: String,
    /// The service account to impersonate, if one was provided.
    account_to_impersonate: Identity,
    /// Base URL of the metadata service that provides default account tokens.
    metadata_service_base_url: String,
    /// Base URL of the IAM API used for impersonation.
    iam_service_base_url: String,
    /// This field is None after instantiation and Some after the first
    /// successful request for a token for the default service account, though
    /// the contained token may be expired.
    default_account_token: Arc<RwLock<Option<AccessToken>>>,
    /// This field is None after instantiation and Some after the first
    /// successful request for a token for the impersonated service account.
    /// Always None if account_to_impersonate is None.
    impersonated_account_token: Arc<RwLock<Option<AccessToken>>>,
    agent: RetryingAgent,
    logger: Logger,
}

impl Debug for GcpOauthTokenProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcpOauthTokenProvider")
            .field("scope", &self.scope)
            .field("account_to_impersonate", &self.account_to_impersonate)
            .field(
                "default_account_token",
                &self.default_account_token.read().unwrap().is_some(),
            )
            .field(
                "impersonated_account_token",
                &self.impersonated_account_token.read().unwrap().is_some(),
            )
            .finish()
    }
}

impl AccessTokenProvider for GcpOauthTokenProvider {
    fn ensure_access_token(&self) -> Result<String, Error> {
        if self.account_to_impersonate.is_none() {
            self.ensure_default_account_token()
        } else {
            self.ensure_impersonated_account_token()
        }
    }
}

impl GcpOauthTokenProvider {
    /// Creates a token provider which can impersonate the specified service
    /// account and requests tokens with the provided scope
    /// (https://developers.google.com/identity/protocols/oauth2/scopes).
    pub fn new(
        scope: &str,
        account_to_impersonate: Identity,
        parent_logger: &Logger,
        api_metrics: &ApiClientMetricsCollector,
    ) -> GcpOauthTokenProvider {
        Self::new_with_base_urls(
            scope,
            account_to_impersonate,
            DEFAULT_METADATA_BASE_URL,
            DEFAULT_IAM_BASE_URL,
            parent_logger,
            api_metrics,
        )
    }

    /// Creates a token provider with the metadata service and IAM API at the
    /// provided base URLs, permitting tests to use a mock server.
    pub fn new_with_base_urls(
        scope: &str,
        account_to_impersonate: Identity,
        metadata_service_base_url: &str,
        iam_service_base_url: &str,
        parent_logger: &Logger,
        api_metrics: &ApiClientMetricsCollector,
    ) -> GcpOauthTokenProvider {
        let logger = parent_logger.new(o!(
            "scope" => scope.to_owned(),
            event::IDENTITY => account_to_impersonate.to_string(),
        ));
        GcpOauthTokenProvider {
            scope: scope.to_owned(),
            account_to_impersonate,
            metadata_service_base_url: metadata_service_base_url.to_owned(),
            iam_service_base_url: iam_service_base_url.to_owned(),
            default_account_token: Arc::new(RwLock::new(None)),
            impersonated_account_token: Arc::new(RwLock::new(None)),
            agent: RetryingAgent::new("oauth", api_metrics),
            logger,
        }
    }

    /// Returns the current OAuth token for the default service account, if it
    /// is valid. Otherwise obtains and returns a new one.
    fn ensure_default_account_token(&self) -> Result<String, Error> {
        if let Some(token) = &*self.default_account_token.read().unwrap() {
            if !token.expired() {
                return Ok(token.token.clone());
            }
        }

        let mut token_holder = self.default_account_token.write().unwrap();
        // Another thread could have refreshed the token while we waited for
        // the write lock
        if let Some(token) = &*token_holder {
            if !token.expired() {
                return Ok(token.token.clone());
            }
        }

        debug!(self.logger, "fetching default service account token");
        let request = self
            .agent
            .prepare_request(RequestParameters {
                url: parse_url(format!(
                    "{}{}",
                    self.metadata_service_base_url, ACCESS_TOKEN_PATH
                ))?,
                method: Method::Get,
                token_provider: None,
            })?
            .set("Metadata-Flavor", "Google");

        let response = self
            .agent
            .call(&self.logger, &request, "metadata-token")?
            .into_json::<MetadataServiceTokenResponse>()
            .context("failed to deserialize response from GKE metadata service")?;

        if response.token_type != "Bearer" {
            return Err(Error::AnyhowError(anyhow!(
                "unexpected token type {}",
                response.token_type
            )));
        }

        *token_holder = Some(AccessToken {
            token: response.access_token.clone(),
            expiration: Utc::now() + Duration::seconds(response.expires_in),
        });

        Ok(response.access_token)
    }

    /// Returns the current OAuth token for the impersonated service account,
    /// if it is valid. Otherwise obtains and returns a new one, authenticating
    /// to the IAM API as the default service account.
    fn ensure_impersonated_account_token(&self) -> Result<String, Error> {
        let account_to_impersonate = self
            .account_to_impersonate
            .as_str()
            .ok_or(Error::MissingArguments("no account to impersonate"))?
            .to_owned();

        if let Some(token) = &*self.impersonated_account_token.read().unwrap() {
            if !token.expired() {
                return Ok(token.token.clone());
            }
        }

        let mut token_holder = self.impersonated_account_token.write().unwrap();
        if let Some(token) = &*token_holder {
            if !token.expired() {
                return Ok(token.token.clone());
            }
        }

        let default_token = self.ensure_default_account_token()?;

        debug!(self.logger, "fetching impersonated service account token");
        // API reference:
        // https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateAccessToken
        let request = self
            .agent
            .prepare_request(RequestParameters {
                url: parse_url(format!(
                    "{}/v1/projects/-/serviceAccounts/{}:generateAccessToken",
                    self.iam_service_base_url, account_to_impersonate
                ))?,
                method: Method::Post,
                token_provider: None,
            })?
            .set("Authorization", &format!("Bearer {}", default_token))
            .set("Content-Type", "application/json");

        let response = self
            .agent
            .send_json_request(
                &self.logger,
                &request,
                "generateAccessToken",
                &ureq::json!({ "scope": [self.scope] }),
            )?
            .into_json::<GenerateAccessTokenResponse>()
            .context("failed to deserialize response from IAM API")?;

        *token_holder = Some(AccessToken {
            token: response.access_token.clone(),
            expiration: response.expire_time,
        });

        Ok(response.access_token)
    }

    /// Returns an identity token for the default service account, scoped to
    /// the provided audience. Identity tokens are only requested when an AWS
    /// IAM role is being assumed, which caches the resulting credentials
    /// itself, so these are not cached here.
    pub fn ensure_identity_token(&self, audience: &str) -> Result<String, Error> {
        debug!(self.logger, "fetching identity token");
        let request = self
            .agent
            .prepare_request(RequestParameters {
                url: parse_url(format!(
                    "{}{}",
                    self.metadata_service_base_url, IDENTITY_TOKEN_PATH
                ))?,
                method: Method::Get,
                token_provider: None,
            })?
            .set("Metadata-Flavor", "Google")
            .query("audience", audience)
            .query("format", "full");

        Ok(self
            .agent
            .call(&self.logger, &request, "metadata-identity")?
            .into_string()
            .context("failed to read identity token from GKE metadata service")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use mockito::{mock, Matcher};

    fn test_provider(account_to_impersonate: Identity, name: &str) -> GcpOauthTokenProvider {
        let logger = setup_test_logging();
        let api_metrics = ApiClientMetricsCollector::new_with_metric_name(name).unwrap();
        GcpOauthTokenProvider::new_with_base_urls(
            "https://www.googleapis.com/auth/devstorage.read_write",
            account_to_impersonate,
            &mockito::server_url(),
            &mockito::server_url(),
            &logger,
            &api_metrics,
        )
    }

    #[test]
    fn default_account_token_fetched_once() {
        let provider = test_provider(Identity::none(), "default_account_token_fetched_once");

        let mocked_get = mock(
            "GET",
            "/computeMetadata/v1/instance/service-accounts/default/token",
        )
        .match_header("Metadata-Flavor", "Google")
        .with_status(200)
        .with_body(
            r#"{"access_token": "fake-token", "expires_in": 3600, "token_type": "Bearer"}"#,
        )
        .expect(1)
        .create();

        assert_eq!(provider.ensure_access_token().unwrap(), "fake-token");
        // Second call must be served from the cache
        assert_eq!(provider.ensure_access_token().unwrap(), "fake-token");

        mocked_get.assert();
    }

    #[test]
    fn impersonated_account_token() {
        let provider = test_provider(
            Identity::from(Some("fake-sa@fake-project.iam.gserviceaccount.com")),
            "impersonated_account_token",
        );

        let mocked_metadata = mock(
            "GET",
            "/computeMetadata/v1/instance/service-accounts/default/token",
        )
        .with_status(200)
        .with_body(
            r#"{"access_token": "default-token", "expires_in": 3600, "token_type": "Bearer"}"#,
        )
        .create();

        let mocked_impersonation = mock(
            "POST",
            "/v1/projects/-/serviceAccounts/fake-sa@fake-project.iam.gserviceaccount.com:generateAccessToken",
        )
        .match_header("Authorization", "Bearer default-token")
        .with_status(200)
        .with_body(
            r#"{"accessToken": "impersonated-token", "expireTime": "2099-01-01T00:00:00Z"}"#,
        )
        .expect(1)
        .create();

        assert_eq!(
            provider.ensure_access_token().unwrap(),
            "impersonated-token"
        );

        mocked_metadata.assert();
        mocked_impersonation.assert();
    }

    #[test]
    fn identity_token() {
        let provider = test_provider(Identity::none(), "identity_token");

        let mocked_get = mock(
            "GET",
            "/computeMetadata/v1/instance/service-accounts/default/identity",
        )
        .match_header("Metadata-Flavor", "Google")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("audience".to_owned(), "sts.amazonaws.com/fake".to_owned()),
            Matcher::UrlEncoded("format".to_owned(), "full".to_owned()),
        ]))
        .with_status(200)
        .with_body("fake-identity-token")
        .create();

        assert_eq!(
            provider.ensure_identity_token("sts.amazonaws.com/fake").unwrap(),
            "fake-identity-token"
        );

        mocked_get.assert();
    }
}
