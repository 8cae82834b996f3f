use async_trait::async_trait;
use rusoto_core::{
    credential::{
        AutoRefreshingProvider, AwsCredentials, ChainProvider, CredentialsError,
        ProvideAwsCredentials, StaticProvider,
    },
    RusotoError,
};
use rusoto_sts::WebIdentityProvider;
use slog::{o, Logger};
use std::fmt::{self, Debug, Display, Formatter};

use crate::{
    config::Identity, gcp_oauth::GcpOauthTokenProvider, logging::event,
    metrics::ApiClientMetricsCollector,
};

// Both the GKE metadata service and sts.amazonaws.com require an audience
// parameter when requesting identity tokens. The value can be anything so
// long as it matches the role assumption policy configured on the AWS IAM
// role being assumed; that policy is scoped to the numeric account ID of a
// specific GCP service account anyway.
const IDENTITY_TOKEN_AUDIENCE: &str = "sts.amazonaws.com/gke-identity-federation";

/// Decides whether a rusoto error is worth retrying: dispatch problems such
/// as the connection being closed under us, throttling, and server errors.
/// Sadly, CredentialsError does not preserve the structure of an underlying
/// dispatch error, just its message, so we must resort to matching on a
/// substring to detect one.
pub(crate) fn is_rusoto_error_retryable<E>(error: &RusotoError<E>) -> bool {
    match error {
        RusotoError::HttpDispatch(_) => true,
        RusotoError::Credentials(err) => err.message.contains("Error during dispatch"),
        RusotoError::Unknown(response) => {
            response.status.is_server_error() || response.status.as_u16() == 429
        }
        _ => false,
    }
}

/// The AWS credentials provider used by every AWS API client in this crate.
/// With no identity configured, credentials come from the default rusoto
/// chain (environment, profile, container, instance metadata). With an IAM
/// role ARN configured, the GKE workload's identity token is exchanged with
/// sts.amazonaws.com for credentials for that role. Either way, the obtained
/// credentials are cached until they expire.
#[derive(Clone)]
pub struct Provider {
    inner: AutoRefreshingProvider<InnerProvider>,
    identity: Identity,
}

impl Provider {
    /// Creates a provider for the given identity. `purpose` distinguishes the
    /// role session names of the different clients in this process.
    pub fn new(
        identity: &Identity,
        purpose: &str,
        parent_logger: &Logger,
        api_metrics: &ApiClientMetricsCollector,
    ) -> Result<Provider, CredentialsError> {
        let logger = parent_logger.new(o!(
            event::IDENTITY => identity.to_string(),
        ));
        let inner = match identity.as_str() {
            None => InnerProvider::Default(ChainProvider::new()),
            Some(role_arn) => InnerProvider::WebIdentity(WebIdentityFederationProvider {
                role_arn: role_arn.to_owned(),
                session_name: format!("workflow-manager-{}", purpose),
                // No scope or impersonation is needed to obtain identity
                // tokens for the default service account
                oauth_token_provider: GcpOauthTokenProvider::new(
                    "openid",
                    Identity::none(),
                    &logger,
                    api_metrics,
                ),
            }),
        };

        Ok(Provider {
            inner: AutoRefreshingProvider::new(inner)?,
            identity: identity.clone(),
        })
    }

    /// Creates a provider that vends fixed, fake credentials. Only suitable
    /// for tests that point rusoto clients at a mock server.
    pub fn new_mock() -> Provider {
        Provider {
            inner: AutoRefreshingProvider::new(InnerProvider::Mock(StaticProvider::new_minimal(
                "fake-access-key".to_owned(),
                "fake-secret-key".to_owned(),
            )))
            // Unwrap safe: AutoRefreshingProvider::new never fails for a
            // provider that does not itself fail to construct
            .unwrap(),
            identity: Identity::none(),
        }
    }
}

#[async_trait]
impl ProvideAwsCredentials for Provider {
    async fn credentials(&self) -> Result<AwsCredentials, CredentialsError> {
        self.inner.credentials().await
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        std::fmt::Display::fmt(&self.identity, f)
    }
}

impl Debug for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("identity", &self.identity)
            .finish()
    }
}

#[derive(Clone)]
enum InnerProvider {
    Default(ChainProvider),
    WebIdentity(WebIdentityFederationProvider),
    Mock(StaticProvider),
}

#[async_trait]
impl ProvideAwsCredentials for InnerProvider {
    async fn credentials(&self) -> Result<AwsCredentials, CredentialsError> {
        match self {
            InnerProvider::Default(p) => p.credentials().await,
            InnerProvider::WebIdentity(p) => p.credentials().await,
            InnerProvider::Mock(p) => p.credentials().await,
        }
    }
}

/// Assumes an IAM role via web identity federation: an OIDC identity token
/// for the workload's GCP service account, obtained from the GKE metadata
/// service, is presented to sts.amazonaws.com in exchange for role
/// credentials. Appropriate trust mappings must be in place from the
/// Kubernetes service account to the GCP service account to the IAM role.
#[derive(Clone)]
struct WebIdentityFederationProvider {
    role_arn: String,
    session_name: String,
    oauth_token_provider: GcpOauthTokenProvider,
}

#[async_trait]
impl ProvideAwsCredentials for WebIdentityFederationProvider {
    async fn credentials(&self) -> Result<AwsCredentials, CredentialsError> {
        let identity_token = self
            .oauth_token_provider
            .ensure_identity_token(IDENTITY_TOKEN_AUDIENCE)
            .map_err(|e| {
                CredentialsError::new(format!("failed to fetch GKE identity token: {}", e))
            })?;

        WebIdentityProvider::new(
            rusoto_core::credential::Secret::from(identity_token),
            self.role_arn.clone(),
            Some(Some(self.session_name.clone())),
        )
        .credentials()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;

    #[test]
    fn provider_construction() {
        let logger = setup_test_logging();
        let api_metrics =
            ApiClientMetricsCollector::new_with_metric_name("provider_construction").unwrap();

        let provider =
            Provider::new(&Identity::none(), "fake-purpose", &logger, &api_metrics).unwrap();
        assert_eq!(provider.to_string(), "default identity");

        let provider = Provider::new(
            &Identity::from(Some("arn:aws:iam::123456789012:role/fake-role")),
            "fake-purpose",
            &logger,
            &api_metrics,
        )
        .unwrap();
        assert_eq!(
            provider.to_string(),
            "arn:aws:iam::123456789012:role/fake-role"
        );
    }
}
