use async_trait::async_trait;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    AuthenticationFailedSnafu, BuildHttpClientSnafu, Endpoint, Error, ExternalUser,
    FetchFailedSnafu, IdentityProvider, IdentitySession, InvalidBaseUrlSnafu,
    ParseCaCertificateSnafu,
};
use crate::transport::{Credentials, TrustConfig};

/// `admin-cli` is the magic client used when authenticating to the admin API
const ADMIN_CLIENT_ID: &str = "admin-cli";

/// Talks to the Keycloak admin REST API.
///
/// A new HTTP client is built for every authentication, as the trust material can differ between
/// AttributeSyncs and change between reconciliations.
#[derive(Clone, Debug, Default)]
pub struct KeycloakProvider;

impl KeycloakProvider {
    fn http_client(trust: &TrustConfig) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(trust.insecure);

        if let Some(ca_certificate) = &trust.ca_certificate {
            let ca_certificate =
                reqwest::Certificate::from_pem(ca_certificate).context(ParseCaCertificateSnafu)?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(ca_certificate);
        }

        builder.build().context(BuildHttpClientSnafu)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

#[async_trait]
impl IdentityProvider for KeycloakProvider {
    #[instrument(skip(self, credentials, trust), fields(username = %credentials.username))]
    async fn authenticate(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        trust: &TrustConfig,
    ) -> Result<Box<dyn IdentitySession>, Error> {
        let http = Self::http_client(trust)?;
        let token_url = realm_url(
            &endpoint.url,
            &[
                "realms",
                &endpoint.login_realm,
                "protocol",
                "openid-connect",
                "token",
            ],
        )?;

        let realm = &endpoint.login_realm;
        let token: TokenResponse = http
            .post(token_url)
            .form(&[
                ("grant_type", "password"),
                ("client_id", ADMIN_CLIENT_ID),
                ("username", credentials.username.as_str()),
                ("password", credentials.password()),
            ])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(AuthenticationFailedSnafu { realm })?
            .json()
            .await
            .context(AuthenticationFailedSnafu { realm })?;

        debug!("authenticated against Keycloak");

        Ok(Box::new(KeycloakSession {
            http,
            endpoint: endpoint.clone(),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
        }))
    }
}

struct KeycloakSession {
    http: reqwest::Client,
    endpoint: Endpoint,
    access_token: String,
    refresh_token: Option<String>,
}

#[async_trait]
impl IdentitySession for KeycloakSession {
    #[instrument(skip(self))]
    async fn list_users(&self, realm: &str) -> Result<Vec<ExternalUser>, Error> {
        let users_url = realm_url(&self.endpoint.url, &["admin", "realms", realm, "users"])?;

        let users: Vec<ExternalUser> = self
            .http
            .get(users_url)
            .bearer_auth(&self.access_token)
            // Keycloak returns 100 users by default, -1 lifts the limit
            .query(&[("max", "-1"), ("briefRepresentation", "false")])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(FetchFailedSnafu { realm })?
            .json()
            .await
            .context(FetchFailedSnafu { realm })?;

        debug!(count = users.len(), "fetched users");
        Ok(users)
    }

    #[instrument(skip(self))]
    async fn logout(&self) {
        let Some(refresh_token) = &self.refresh_token else {
            return;
        };

        let logout_url = match realm_url(
            &self.endpoint.url,
            &[
                "realms",
                &self.endpoint.login_realm,
                "protocol",
                "openid-connect",
                "logout",
            ],
        ) {
            Ok(url) => url,
            Err(error) => {
                warn!(error = &error as &dyn std::error::Error, "failed to log out");
                return;
            }
        };

        let result = self
            .http
            .post(logout_url)
            .bearer_auth(&self.access_token)
            .form(&[
                ("client_id", ADMIN_CLIENT_ID),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        if let Err(error) = result {
            warn!(error = &error as &dyn std::error::Error, "failed to log out");
        }
    }
}

/// Appends `segments` to the path of `base`, percent-encoding each of them.
fn realm_url(base: &Url, segments: &[&str]) -> Result<Url, Error> {
    let mut url = base.clone();
    url.path_segments_mut()
        .ok()
        .with_context(|| InvalidBaseUrlSnafu { url: base.clone() })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
