//! Narrow storage interfaces used by the sync engine, together with their Kubernetes backed
//! implementations.
//!
//! The engine only ever reads secrets, reads and conditionally writes target objects, and
//! writes the status of [`AttributeSync`] objects, so that is all these traits offer.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, ResourceExt,
    api::{ApiResource, DynamicObject, Patch, PatchParams},
};
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::crd::AttributeSync;

const HTTP_STATUS_NOT_FOUND: u16 = 404;
const HTTP_STATUS_CONFLICT: u16 = 409;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {kind} {name:?}"))]
    Get {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to update {kind} {name:?}"))]
    Update {
        source: kube::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("{kind} {name:?} has no namespace"))]
    ObjectHasNoNamespace { kind: String, name: String },

    #[snafu(display("storage backend failed: {message}"))]
    Backend { message: String },
}

/// A cluster scoped object the attribute is synced onto.
///
/// The `resource_version` is captured together with labels and annotations on every read and
/// must be passed back unchanged on write.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TargetObject {
    pub name: String,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Written,

    /// The object was modified since it was read.
    Conflict,

    /// The object was deleted since it was read.
    NotFound,
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the data of the secret, or [`None`] if the secret does not exist.
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Returns the object, or [`None`] if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<TargetObject>, Error>;

    /// Writes labels and annotations of `object`, provided its `resource_version` is still
    /// current.
    async fn update(&self, object: &TargetObject) -> Result<WriteOutcome, Error>;
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Persists the status of `attribute_sync`.
    async fn update(&self, attribute_sync: &AttributeSync) -> Result<(), Error>;
}

pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await.with_context(|_| GetSnafu {
            kind: "Secret",
            name: format!("{namespace}/{name}"),
        })?;

        Ok(secret.map(|secret| {
            secret
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }
}

/// Stores cluster scoped target objects of an arbitrary kind, `user.openshift.io/v1` `User` by
/// default.
pub struct KubeTargetStore {
    api: Api<DynamicObject>,
    kind: String,
    patch_params: PatchParams,
}

impl KubeTargetStore {
    pub fn new(client: Client, api_resource: &ApiResource, field_manager: &str) -> Self {
        Self {
            api: Api::all_with(client, api_resource),
            kind: api_resource.kind.clone(),
            patch_params: PatchParams {
                field_manager: Some(field_manager.to_owned()),
                ..PatchParams::default()
            },
        }
    }
}

#[async_trait]
impl TargetStore for KubeTargetStore {
    async fn get(&self, name: &str) -> Result<Option<TargetObject>, Error> {
        let object = self.api.get_opt(name).await.with_context(|_| GetSnafu {
            kind: &self.kind,
            name,
        })?;

        Ok(object.map(|object| TargetObject {
            name: object.name_any(),
            resource_version: object.resource_version(),
            labels: object.metadata.labels.unwrap_or_default(),
            annotations: object.metadata.annotations.unwrap_or_default(),
        }))
    }

    async fn update(&self, object: &TargetObject) -> Result<WriteOutcome, Error> {
        // The API server rejects the patch with a conflict if the resourceVersion is stale
        let patch = json!({
            "metadata": {
                "resourceVersion": object.resource_version,
                "labels": object.labels,
                "annotations": object.annotations,
            }
        });

        match self
            .api
            .patch(&object.name, &self.patch_params, &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(WriteOutcome::Written),
            Err(kube::Error::Api(response)) if response.code == HTTP_STATUS_CONFLICT => {
                Ok(WriteOutcome::Conflict)
            }
            Err(kube::Error::Api(response)) if response.code == HTTP_STATUS_NOT_FOUND => {
                Ok(WriteOutcome::NotFound)
            }
            Err(source) => Err(source).context(UpdateSnafu {
                kind: &self.kind,
                name: &object.name,
            }),
        }
    }
}

pub struct KubeStatusStore {
    client: Client,
    patch_params: PatchParams,
}

impl KubeStatusStore {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            patch_params: PatchParams {
                field_manager: Some(field_manager.to_owned()),
                ..PatchParams::default()
            },
        }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn update(&self, attribute_sync: &AttributeSync) -> Result<(), Error> {
        let name = attribute_sync.name_any();
        let namespace = attribute_sync
            .namespace()
            .with_context(|| ObjectHasNoNamespaceSnafu {
                kind: "AttributeSync",
                name: &name,
            })?;

        let api: Api<AttributeSync> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({ "status": attribute_sync.status });
        api.patch_status(&name, &self.patch_params, &Patch::Merge(&patch))
            .await
            .with_context(|_| UpdateSnafu {
                kind: "AttributeSync",
                name: format!("{namespace}/{name}"),
            })?;

        Ok(())
    }
}
