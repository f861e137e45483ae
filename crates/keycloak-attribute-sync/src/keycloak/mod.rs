//! The identity provider side of the sync: authenticating against Keycloak and listing the
//! users of a realm together with their attributes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use snafu::Snafu;
use url::Url;

use crate::transport::{Credentials, TrustConfig};

pub mod client;

pub use client::KeycloakProvider;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse CA certificate"))]
    ParseCaCertificate { source: reqwest::Error },

    #[snafu(display("failed to build HTTP client"))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("{url} cannot be used as base URL"))]
    InvalidBaseUrl { url: Url },

    #[snafu(display("authentication against realm {realm:?} failed"))]
    AuthenticationFailed {
        #[snafu(source(from(reqwest::Error, Into::into)))]
        source: BoxedError,
        realm: String,
    },

    #[snafu(display("failed to fetch users of realm {realm:?}"))]
    FetchFailed {
        #[snafu(source(from(reqwest::Error, Into::into)))]
        source: BoxedError,
        realm: String,
    },
}

/// Where to reach Keycloak and which realm to log in to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub url: Url,
    pub login_realm: String,
}

/// A user as returned by the Keycloak admin API.
///
/// An unset attribute map, an empty value list and a list containing an empty string are all
/// distinct.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct ExternalUser {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub attributes: Option<BTreeMap<String, Vec<String>>>,
}

impl ExternalUser {
    /// Returns the first value of the attribute `key`.
    ///
    /// Returns [`None`] if the user has no attributes, lacks the attribute or the attribute has
    /// no values.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .as_ref()?
            .get(key)?
            .first()
            .map(String::as_str)
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Logs in to the `endpoint` and returns a session for the admin API.
    async fn authenticate(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        trust: &TrustConfig,
    ) -> Result<Box<dyn IdentitySession>, Error>;
}

#[async_trait]
pub trait IdentitySession: Send + Sync {
    /// Lists all users of the `realm`, without any page limit.
    async fn list_users(&self, realm: &str) -> Result<Vec<ExternalUser>, Error>;

    /// Ends the session. Failures are only logged.
    async fn logout(&self);
}
