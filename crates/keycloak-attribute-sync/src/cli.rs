//! Command line interface of the operator.
//!
//! ```no_run
//! use clap::Parser;
//! use keycloak_attribute_sync::cli::{Command, Opts};
//!
//! let opts = Opts::parse();
//! match opts.command {
//!     Command::Crd => { /* print the CRD */ }
//!     Command::Run(run) => { /* run the controller */ }
//! }
//! ```

use std::num::NonZeroU32;

use clap::{Args, Parser};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Api, Client, Resource,
    core::{ApiResource, GroupVersionKind},
};

use crate::updater::ConflictPolicy;

pub const DEFAULT_FIELD_MANAGER: &str = "keycloak-attribute-sync";

#[derive(Debug, Parser)]
#[command(
    name = "keycloak-attribute-sync",
    author,
    version,
    about = "Syncs Keycloak user attributes onto cluster users"
)]
pub struct Opts {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command {
    /// Print CRD objects.
    Crd,

    /// Run the operator.
    Run(RunArguments),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    /// Provides a specific namespace to watch (instead of watching all namespaces)
    #[arg(long, env, default_value = "")]
    pub watch_namespace: WatchNamespace,

    /// Gives up updating a single target object after this many conflicting writes. Retries
    /// indefinitely if not set.
    #[arg(long, env)]
    pub max_conflict_retries: Option<NonZeroU32>,

    /// Field manager used for all writes to the API server.
    #[arg(long, env, default_value = DEFAULT_FIELD_MANAGER)]
    pub field_manager: String,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub target: TargetResourceOptions,
}

impl RunArguments {
    pub fn conflict_policy(&self) -> ConflictPolicy {
        ConflictPolicy {
            max_attempts: self.max_conflict_retries,
        }
    }
}

/// The cluster scoped resource the attributes are synced onto.
#[derive(Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Target resource options")]
pub struct TargetResourceOptions {
    /// API group of the target resource.
    #[arg(long, env, default_value = "user.openshift.io")]
    pub target_group: String,

    /// API version of the target resource.
    #[arg(long, env, default_value = "v1")]
    pub target_version: String,

    /// Kind of the target resource.
    #[arg(long, env, default_value = "User")]
    pub target_kind: String,

    /// Plural resource name of the target resource.
    #[arg(long, env, default_value = "users")]
    pub target_plural: String,
}

impl TargetResourceOptions {
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.target_group, &self.target_version, &self.target_kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.target_plural)
    }
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum WatchNamespace {
    All,
    One(String),
}

impl From<&str> for WatchNamespace {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::All
        } else {
            Self::One(s.to_owned())
        }
    }
}

impl WatchNamespace {
    /// Gets an API object for the namespace in question or for all namespaces,
    /// depending on which variant we are.
    pub fn get_api<T>(&self, client: &Client) -> Api<T>
    where
        T: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
    {
        match self {
            Self::All => Api::all(client.clone()),
            Self::One(namespace) => Api::namespaced(client.clone(), namespace),
        }
    }
}
