use dyn_clone::DynClone;
use slog::Logger;
use std::{
    fmt::Debug,
    time::{Duration, Instant},
};
use ureq::{Agent, AgentBuilder, Request, Response, SerdeValue};
use url::Url;

use crate::{metrics::ApiClientMetricsCollector, retries::retry_request, Error};

/// The HTTP methods used by this crate's API clients.
#[derive(Debug)]
pub(crate) enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

/// An HTTP agent that attaches "Authorization" headers to requests and
/// retries failed ones with exponential backoff. Transport-level failures and
/// HTTP 5xx responses are always retryable; a client may list further status
/// codes to retry (e.g. 429 where a service documents throttling behavior).
/// Request latencies are recorded under the provided service label.
#[derive(Debug, Clone)]
pub(crate) struct RetryingAgent {
    agent: Agent,
    /// Status codes that are retryable in addition to the 5xx range.
    additional_retryable_http_status_codes: Vec<u16>,
    service: String,
    api_metrics: ApiClientMetricsCollector,
}

impl RetryingAgent {
    /// Creates a `RetryingAgent` over a custom `ureq::Agent` with the
    /// provided extra retryable status codes.
    pub fn new_with_agent(
        agent: Agent,
        additional_retryable_http_status_codes: Vec<u16>,
        service: &str,
        api_metrics: &ApiClientMetricsCollector,
    ) -> Self {
        Self {
            agent,
            additional_retryable_http_status_codes,
            service: service.to_string(),
            api_metrics: api_metrics.clone(),
        }
    }

    /// Creates an agent suitable for most clients in this crate: no extra
    /// retryable status codes, and a 30 second timeout bounding each
    /// individual request. ureq would otherwise wait forever.
    pub fn new(service: &str, api_metrics: &ApiClientMetricsCollector) -> Self {
        Self::new_with_agent(
            AgentBuilder::new().timeout(Duration::from_secs(30)).build(),
            vec![],
            service,
            api_metrics,
        )
    }

    /// Builds a `ureq::Request` for the provided `RequestParameters`,
    /// obtaining a bearer token from the token provider if one was supplied.
    /// The caller may add headers or query parameters to the returned
    /// request, but must send it through `send_json_request`, `send_bytes` or
    /// `call` to get retries. Returns an error if the token provider fails to
    /// produce a token.
    pub(crate) fn prepare_request(&self, parameters: RequestParameters) -> Result<Request, Error> {
        let mut request = self
            .agent
            .request_url(parameters.method.as_str(), &parameters.url);
        if let Some(token_provider) = parameters.token_provider {
            let token = token_provider.ensure_access_token()?;
            request = request.set("Authorization", &format!("Bearer {}", token));
        }
        Ok(request)
    }

    fn is_retryable_status(&self, http_status: u16) -> bool {
        http_status >= 500
            || self
                .additional_retryable_http_status_codes
                .contains(&http_status)
    }

    fn is_retryable(&self, error: &ureq::Error) -> bool {
        match error {
            ureq::Error::Status(http_status, _) => self.is_retryable_status(*http_status),
            ureq::Error::Transport(_) => true,
        }
    }

    /// Sends the request with the provided JSON body.
    pub(crate) fn send_json_request(
        &self,
        logger: &Logger,
        request: &Request,
        endpoint: &'static str,
        body: &SerdeValue,
    ) -> Result<Response, Error> {
        Ok(retry_request(
            logger,
            || self.observed(endpoint, || request.clone().send_json(body.clone())),
            |ureq_error| self.is_retryable(ureq_error),
        )?)
    }

    /// Sends the request with the provided bytes as its body.
    pub(crate) fn send_bytes(
        &self,
        logger: &Logger,
        request: &Request,
        endpoint: &'static str,
        data: &[u8],
    ) -> Result<Response, Error> {
        Ok(retry_request(
            logger,
            || self.observed(endpoint, || request.clone().send_bytes(data)),
            |ureq_error| self.is_retryable(ureq_error),
        )?)
    }

    /// Sends the request with no body.
    pub(crate) fn call(
        &self,
        logger: &Logger,
        request: &Request,
        endpoint: &'static str,
    ) -> Result<Response, Error> {
        Ok(retry_request(
            logger,
            || self.observed(endpoint, || request.clone().call()),
            |ureq_error| self.is_retryable(ureq_error),
        )?)
    }

    /// Runs a single request attempt, recording its latency and status under
    /// this agent's service label and the provided endpoint label.
    fn observed<F>(&self, endpoint: &'static str, mut attempt: F) -> Result<Response, ureq::Error>
    where
        F: FnMut() -> Result<Response, ureq::Error>,
    {
        let before = Instant::now();
        let result = attempt();
        let latency = before.elapsed().as_millis();

        let http_status_label = match result {
            Ok(ref response) => response.status().to_string(),
            Err(ureq::Error::Status(http_status, _)) => http_status.to_string(),
            Err(_) => "unknown".to_owned(),
        };

        self.api_metrics
            .latency
            .with_label_values(&[&self.service, endpoint, &http_status_label])
            .observe(latency as f64);

        result
    }
}

/// Produces bearer tokens for authenticating requests to cloud APIs.
pub(crate) trait AccessTokenProvider: Debug + DynClone + Send + Sync {
    /// Returns a valid bearer token.
    fn ensure_access_token(&self) -> Result<String, Error>;
}

dyn_clone::clone_trait_object!(AccessTokenProvider);

/// An AccessTokenProvider that hands out a fixed token. Used in tests, where
/// no token endpoint is available.
#[derive(Clone, Debug)]
pub(crate) struct StaticAccessTokenProvider {
    pub token: String,
}

impl AccessTokenProvider for StaticAccessTokenProvider {
    fn ensure_access_token(&self) -> Result<String, Error> {
        Ok(self.token.clone())
    }
}

impl From<String> for StaticAccessTokenProvider {
    fn from(token: String) -> Self {
        StaticAccessTokenProvider { token }
    }
}

/// The parameters of a request to be prepared by a RetryingAgent.
#[derive(Debug)]
pub(crate) struct RequestParameters<'a> {
    /// The URL to request
    pub url: Url,
    /// The HTTP method of the request
    pub method: Method,
    /// When set, the request carries an "Authorization" header with a bearer
    /// token from this provider. When unset, the request is unauthenticated.
    pub token_provider: Option<&'a dyn AccessTokenProvider>,
}
