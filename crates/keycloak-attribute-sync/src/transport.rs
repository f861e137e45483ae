//! Resolves the credentials and trust material needed to talk to Keycloak.

use std::fmt;

use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{crd::SecretReference, store::SecretStore};

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const CA_CERT_KEY: &str = "ca.crt";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to retrieve secret {secret}"))]
    GetSecret {
        source: crate::store::Error,
        secret: SecretReference,
    },

    #[snafu(display("secret {secret} not found"))]
    SecretNotFound { secret: SecretReference },

    #[snafu(display("missing field `{field}` in secret {secret}"))]
    MissingCredentialField {
        field: &'static str,
        secret: SecretReference,
    },

    #[snafu(display("missing field `{CA_CERT_KEY}` in secret {secret}"))]
    MissingCaField { secret: SecretReference },

    #[snafu(display("field `{field}` in secret {secret} is not valid UTF-8"))]
    InvalidCredentialEncoding {
        source: std::string::FromUtf8Error,
        field: &'static str,
        secret: SecretReference,
    },
}

impl Error {
    /// The secret that could not be used.
    pub fn secret(&self) -> &SecretReference {
        match self {
            Self::GetSecret { secret, .. }
            | Self::SecretNotFound { secret }
            | Self::MissingCredentialField { secret, .. }
            | Self::MissingCaField { secret }
            | Self::InvalidCredentialEncoding { secret, .. } => secret,
        }
    }
}

/// Username and password for the Keycloak admin API. Only lives for a single reconciliation.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the certificate of the Keycloak server is verified.
///
/// Without a pinned CA certificate the system trust roots are used.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrustConfig {
    /// PEM encoded CA certificate(s).
    pub ca_certificate: Option<Vec<u8>>,

    /// Skip certificate verification entirely.
    pub insecure: bool,
}

pub struct TransportBuilder<'a> {
    secrets: &'a dyn SecretStore,
}

impl<'a> TransportBuilder<'a> {
    pub fn new(secrets: &'a dyn SecretStore) -> Self {
        Self { secrets }
    }

    #[instrument(skip(self))]
    pub async fn build(
        &self,
        credentials_secret: &SecretReference,
        ca_secret: Option<&SecretReference>,
        insecure: bool,
    ) -> Result<(Credentials, TrustConfig), Error> {
        let mut data = self.secret_data(credentials_secret).await?;
        let mut take_field = |field: &'static str| -> Result<String, Error> {
            let value = data.remove(field).context(MissingCredentialFieldSnafu {
                field,
                secret: credentials_secret.clone(),
            })?;
            String::from_utf8(value).context(InvalidCredentialEncodingSnafu {
                field,
                secret: credentials_secret.clone(),
            })
        };
        let credentials = Credentials::new(take_field(USERNAME_KEY)?, take_field(PASSWORD_KEY)?);

        let ca_certificate = match ca_secret {
            Some(ca_secret) => {
                debug!(secret = %ca_secret, "pinning CA certificate");
                let mut data = self.secret_data(ca_secret).await?;
                let ca_certificate = data.remove(CA_CERT_KEY).context(MissingCaFieldSnafu {
                    secret: ca_secret.clone(),
                })?;
                Some(ca_certificate)
            }
            None => None,
        };

        Ok((
            credentials,
            TrustConfig {
                ca_certificate,
                insecure,
            },
        ))
    }

    async fn secret_data(
        &self,
        secret: &SecretReference,
    ) -> Result<std::collections::BTreeMap<String, Vec<u8>>, Error> {
        self.secrets
            .get(&secret.namespace, &secret.name)
            .await
            .with_context(|_| GetSecretSnafu {
                secret: secret.clone(),
            })?
            .with_context(|| SecretNotFoundSnafu {
                secret: secret.clone(),
            })
    }
}
