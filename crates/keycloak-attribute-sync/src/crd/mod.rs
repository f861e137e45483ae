//! This module provides the [`AttributeSync`] custom resource, which configures the
//! synchronization of a single Keycloak user attribute onto cluster user objects.
//!
//! The resource is consumed as a plain configuration record. All defaulting happens once per
//! reconciliation in [`AttributeSync::resolve`], which produces a [`ResolvedAttributeSync`] that
//! the rest of the pipeline works with.

use std::fmt::Display;

use k8s_openapi::{
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
use kube::{CustomResource, ResourceExt, runtime::reflector::ObjectRef};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use url::Url;

use crate::schedule::{self, Schedule};

pub const DEFAULT_LOGIN_REALM: &str = "master";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("AttributeSync {name:?} has no namespace"))]
    ObjectHasNoNamespace { name: String },

    #[snafu(display("invalid schedule"))]
    InvalidSchedule { source: schedule::Error },
}

/// AttributeSync specifies which attribute of the Keycloak users of a realm is copied onto
/// the matching cluster user objects, and where it ends up.
#[derive(Clone, CustomResource, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "keycloak.appuio.ch",
    version = "v1alpha1",
    kind = "AttributeSync",
    plural = "attributesyncs",
    status = "AttributeSyncStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSyncSpec {
    /// Location of the Keycloak server, e.g. `https://keycloak.example.com`.
    pub url: Url,

    /// The Keycloak realm to authenticate against. Defaults to `master`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_realm: Option<String>,

    /// The realm containing the users to synchronize.
    pub realm: String,

    /// Reference to a secret containing the `username` and `password` used to authenticate
    /// against the Keycloak admin API.
    pub credentials_secret: SecretRef,

    /// Reference to a secret containing a `ca.crt` entry used to verify the certificate of the
    /// Keycloak server. The system trust store is used if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret: Option<SecretRef>,

    /// Whether to skip verification of the Keycloak server certificate.
    #[serde(default)]
    pub insecure: bool,

    /// The user attribute to sync. Only the first value of the attribute is used.
    pub attribute: String,

    /// The label the attribute is written to.
    #[serde(
        default,
        rename = "target_label",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_label: Option<String>,

    /// The annotation the attribute is written to.
    #[serde(
        default,
        rename = "target_annotation",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_annotation: Option<String>,

    /// Cron based schedule for periodic synchronization, e.g. `@every 5m` or `*/15 * * * *`.
    /// Without a schedule the sync only runs when the AttributeSync changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

/// A reference to a secret. The namespace defaults to the namespace of the AttributeSync.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Name of the secret.
    pub name: String,

    /// Namespace of the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SecretRef {
    /// Resolves the reference, falling back to `default_namespace` if no (or an empty)
    /// namespace is set.
    pub fn resolve(&self, default_namespace: &str) -> SecretReference {
        let namespace = match self.namespace.as_deref() {
            Some(namespace) if !namespace.is_empty() => namespace,
            _ => default_namespace,
        };

        SecretReference {
            namespace: namespace.to_owned(),
            name: self.name.clone(),
        }
    }
}

/// A fully resolved secret reference with a mandatory namespace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

// Use ObjectRef for logging/errors
impl Display for SecretReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        ObjectRef::<Secret>::from(self).fmt(f)
    }
}

impl From<&SecretReference> for ObjectRef<Secret> {
    fn from(val: &SecretReference) -> Self {
        Self::new(&val.name).within(&val.namespace)
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSyncStatus {
    /// At most one condition per type is kept, a newer condition replaces the older one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// The time the last synchronization completed successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_success_time: Option<Time>,

    /// Number of failed synchronizations since the last successful one. Failed
    /// synchronizations are retried with a delay growing with this number.
    // Always serialized, a merge patch omitting it would not reset it
    #[serde(default)]
    pub consecutive_failures: u32,
}

/// The [`AttributeSyncSpec`] with all defaults applied.
#[derive(Debug)]
pub struct ResolvedAttributeSync {
    pub url: Url,
    pub login_realm: String,
    pub realm: String,
    pub credentials_secret: SecretReference,
    pub ca_secret: Option<SecretReference>,
    pub insecure: bool,
    pub attribute: String,
    pub target_label: Option<String>,
    pub target_annotation: Option<String>,
    pub schedule: Option<Schedule>,
}

impl AttributeSync {
    /// Applies all defaults of the [`AttributeSyncSpec`] and parses the schedule.
    pub fn resolve(&self) -> Result<ResolvedAttributeSync, Error> {
        let namespace = self
            .namespace()
            .context(ObjectHasNoNamespaceSnafu {
                name: self.name_any(),
            })?;
        let spec = &self.spec;

        let schedule = non_empty(spec.schedule.as_deref())
            .map(Schedule::parse)
            .transpose()
            .context(InvalidScheduleSnafu)?;

        Ok(ResolvedAttributeSync {
            url: spec.url.clone(),
            login_realm: self.login_realm().to_owned(),
            realm: spec.realm.clone(),
            credentials_secret: spec.credentials_secret.resolve(&namespace),
            ca_secret: spec
                .ca_secret
                .as_ref()
                .map(|ca_secret| ca_secret.resolve(&namespace)),
            insecure: spec.insecure,
            attribute: spec.attribute.clone(),
            target_label: non_empty(spec.target_label.as_deref()).map(str::to_owned),
            target_annotation: non_empty(spec.target_annotation.as_deref()).map(str::to_owned),
            schedule,
        })
    }

    pub fn login_realm(&self) -> &str {
        non_empty(self.spec.login_realm.as_deref()).unwrap_or(DEFAULT_LOGIN_REALM)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn attribute_sync(namespace: Option<&str>) -> AttributeSync {
        let mut attribute_sync = AttributeSync::new(
            "sync-organization",
            AttributeSyncSpec {
                url: Url::parse("https://keycloak.example.com").unwrap(),
                login_realm: None,
                realm: "customers".to_owned(),
                credentials_secret: SecretRef {
                    name: "keycloak-credentials".to_owned(),
                    namespace: None,
                },
                ca_secret: None,
                insecure: false,
                attribute: "organization".to_owned(),
                target_label: None,
                target_annotation: Some("example.com/organization".to_owned()),
                schedule: None,
            },
        );
        attribute_sync.metadata.namespace = namespace.map(str::to_owned);
        attribute_sync
    }

    #[rstest]
    #[case::unset(None, "master")]
    #[case::empty(Some(""), "master")]
    #[case::set(Some("override"), "override")]
    fn login_realm_defaults_to_master(#[case] login_realm: Option<&str>, #[case] expected: &str) {
        let mut attribute_sync = attribute_sync(Some("myapp"));
        attribute_sync.spec.login_realm = login_realm.map(str::to_owned);

        assert_eq!(attribute_sync.login_realm(), expected);
    }

    #[rstest]
    #[case::unset(None, "myapp")]
    #[case::empty(Some(""), "myapp")]
    #[case::set(Some("override"), "override")]
    fn secret_namespace_defaults_to_own_namespace(
        #[case] namespace: Option<&str>,
        #[case] expected: &str,
    ) {
        let mut attribute_sync = attribute_sync(Some("myapp"));
        attribute_sync.spec.credentials_secret.namespace = namespace.map(str::to_owned);
        attribute_sync.spec.ca_secret = Some(SecretRef {
            name: "keycloak-ca".to_owned(),
            namespace: namespace.map(str::to_owned),
        });

        let resolved = attribute_sync.resolve().unwrap();
        assert_eq!(resolved.credentials_secret.namespace, expected);
        assert_eq!(resolved.ca_secret.unwrap().namespace, expected);
    }

    #[test]
    fn ca_secret_stays_unset() {
        let resolved = attribute_sync(Some("myapp")).resolve().unwrap();
        assert_eq!(resolved.ca_secret, None);
    }

    #[test]
    fn empty_targets_are_treated_as_unset() {
        let mut attribute_sync = attribute_sync(Some("myapp"));
        attribute_sync.spec.target_label = Some(String::new());
        attribute_sync.spec.target_annotation = Some(String::new());
        attribute_sync.spec.schedule = Some(String::new());

        let resolved = attribute_sync.resolve().unwrap();
        assert_eq!(resolved.target_label, None);
        assert_eq!(resolved.target_annotation, None);
        assert!(resolved.schedule.is_none());
    }

    #[test]
    fn invalid_schedule_is_rejected() {
        let mut attribute_sync = attribute_sync(Some("myapp"));
        attribute_sync.spec.schedule = Some("every now and then".to_owned());

        assert!(matches!(
            attribute_sync.resolve(),
            Err(Error::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn missing_namespace_is_rejected() {
        assert!(matches!(
            attribute_sync(None).resolve(),
            Err(Error::ObjectHasNoNamespace { .. })
        ));
    }

    #[test]
    fn spec_uses_snake_case_target_keys() {
        let spec: AttributeSyncSpec = serde_json::from_value(serde_json::json!({
            "url": "https://keycloak.example.com",
            "realm": "customers",
            "credentialsSecret": { "name": "keycloak-credentials" },
            "attribute": "organization",
            "target_label": "example.com/organization",
        }))
        .unwrap();

        assert_eq!(
            spec.target_label.as_deref(),
            Some("example.com/organization")
        );
        assert_eq!(spec.target_annotation, None);
        assert!(!spec.insecure);
    }
}
