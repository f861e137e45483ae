//! Reconciles [`AttributeSync`] objects.
//!
//! A reconciliation resolves the configuration, logs in to Keycloak, lists all users of the
//! realm and writes the configured attribute of every user onto the target object of the same
//! name. The outcome is always recorded as a condition on the AttributeSync.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    core::DynamicObject,
    runtime::{controller::Action, reflector::ObjectRef},
};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info, instrument, trace};

use crate::{
    crd::{self, AttributeSync, ResolvedAttributeSync},
    keycloak::{self, Endpoint, ExternalUser, IdentityProvider},
    logging::controller::ReconcilerError,
    pacing::{self, Due},
    schedule,
    status::condition::ConditionTracker,
    store::{SecretStore, StatusStore, TargetStore},
    transport::{self, TransportBuilder},
    updater::{self, ApplyOutcome, ConflictPolicy, ConflictRetryingUpdater, TargetKeys},
};

pub const FULL_CONTROLLER_NAME: &str = "attributesync.keycloak.appuio.ch";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("invalid AttributeSync"))]
    ResolveConfig { source: crd::Error },

    #[snafu(display("failed fetching credentials"))]
    ResolveTransport { source: transport::Error },

    #[snafu(display("failed binding to keycloak"))]
    Authenticate { source: keycloak::Error },

    #[snafu(display("error fetching users"))]
    FetchUsers { source: keycloak::Error },

    #[snafu(display("failed syncing user {username:?}"))]
    SyncUser {
        source: updater::Error,
        username: String,
    },

    #[snafu(display("failed to compute the next scheduled run"))]
    Reschedule { source: schedule::Error },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Self::ResolveTransport { source } => {
                Some(ObjectRef::<Secret>::from(source.secret()).erase())
            }
            Self::ResolveConfig { .. }
            | Self::Authenticate { .. }
            | Self::FetchUsers { .. }
            | Self::SyncUser { .. }
            | Self::Reschedule { .. } => None,
        }
    }
}

/// Runs the sync for a single AttributeSync. Holds no state besides its collaborators, so a
/// single instance serves all AttributeSyncs concurrently.
pub struct SyncOrchestrator {
    secrets: Arc<dyn SecretStore>,
    targets: Arc<dyn TargetStore>,
    status: Arc<dyn StatusStore>,
    identity_provider: Arc<dyn IdentityProvider>,
    conflict_policy: ConflictPolicy,
}

impl SyncOrchestrator {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        targets: Arc<dyn TargetStore>,
        status: Arc<dyn StatusStore>,
        identity_provider: Arc<dyn IdentityProvider>,
        conflict_policy: ConflictPolicy,
    ) -> Self {
        Self {
            secrets,
            targets,
            status,
            identity_provider,
            conflict_policy,
        }
    }

    /// Syncs all users and records the outcome on the status of `attribute_sync`.
    ///
    /// Returns the time until the next scheduled run, if a schedule is set.
    #[instrument(skip_all, fields(attribute_sync = %ObjectRef::from_obj(attribute_sync)))]
    pub async fn reconcile(
        &self,
        attribute_sync: &AttributeSync,
    ) -> Result<Option<Duration>, Error> {
        let result = self.sync(attribute_sync).await;

        let mut attribute_sync = attribute_sync.clone();
        let tracker = ConditionTracker::new(self.status.as_ref());
        match &result {
            Ok(_) => tracker.record_success(&mut attribute_sync).await,
            Err(error) => tracker.record_failure(&mut attribute_sync, error).await,
        }

        result
    }

    async fn sync(&self, attribute_sync: &AttributeSync) -> Result<Option<Duration>, Error> {
        let config = attribute_sync.resolve().context(ResolveConfigSnafu)?;

        let (credentials, trust) = TransportBuilder::new(self.secrets.as_ref())
            .build(
                &config.credentials_secret,
                config.ca_secret.as_ref(),
                config.insecure,
            )
            .await
            .context(ResolveTransportSnafu)?;

        let endpoint = Endpoint {
            url: config.url.clone(),
            login_realm: config.login_realm.clone(),
        };
        let session = self
            .identity_provider
            .authenticate(&endpoint, &credentials, &trust)
            .await
            .context(AuthenticateSnafu)?;
        let users = session.list_users(&config.realm).await;
        session.logout().await;
        let users = users.context(FetchUsersSnafu)?;

        self.sync_users(&config, &users).await?;

        config
            .schedule
            .as_ref()
            .map(|schedule| schedule.next_run(Utc::now()))
            .transpose()
            .context(RescheduleSnafu)
    }

    async fn sync_users(
        &self,
        config: &ResolvedAttributeSync,
        users: &[ExternalUser],
    ) -> Result<(), Error> {
        let updater = ConflictRetryingUpdater::new(self.targets.as_ref(), self.conflict_policy);
        let keys = TargetKeys {
            label: config.target_label.as_deref(),
            annotation: config.target_annotation.as_deref(),
        };

        let mut synced = 0_usize;
        let mut skipped = 0_usize;
        for user in users {
            let Some(username) = user.username.as_deref() else {
                trace!(user.id = user.id.as_deref(), "user has no username - skipping");
                skipped += 1;
                continue;
            };
            let Some(value) = user.attribute(&config.attribute) else {
                trace!(user.name = username, "user has no value for attribute - skipping");
                skipped += 1;
                continue;
            };

            match updater
                .apply(username, value, keys)
                .await
                .context(SyncUserSnafu { username })?
            {
                ApplyOutcome::Applied => synced += 1,
                ApplyOutcome::Skipped => skipped += 1,
            }
        }

        info!(
            attribute = config.attribute.as_str(),
            realm = config.realm.as_str(),
            synced,
            skipped,
            "synced users"
        );
        Ok(())
    }
}

/// Entry point for the controller runtime. Events that arrive before the AttributeSync is due
/// again, such as the ones caused by our own status updates, only requeue it.
pub async fn reconcile(
    attribute_sync: Arc<AttributeSync>,
    ctx: Arc<SyncOrchestrator>,
) -> Result<Action, Error> {
    // An invalid schedule is reported by the sync, until then only the status decides
    let schedule = attribute_sync
        .resolve()
        .ok()
        .and_then(|config| config.schedule);
    match pacing::sync_due(&attribute_sync, schedule.as_ref(), Utc::now()) {
        Due::Now => {}
        Due::After(requeue_after) => {
            debug!(
                attribute_sync = %ObjectRef::from_obj(attribute_sync.as_ref()),
                ?requeue_after,
                "not due yet"
            );
            return Ok(Action::requeue(requeue_after));
        }
        Due::OnChange => return Ok(Action::await_change()),
    }

    Ok(match ctx.reconcile(&attribute_sync).await? {
        Some(requeue_after) => Action::requeue(requeue_after),
        None => Action::await_change(),
    })
}

/// Retries with a delay doubling with every failure since the last successful sync.
// Signature required by `Controller::run`
#[allow(clippy::needless_pass_by_value)]
pub fn error_policy(
    attribute_sync: Arc<AttributeSync>,
    _error: &Error,
    _ctx: Arc<SyncOrchestrator>,
) -> Action {
    // The status of `attribute_sync` predates the failure that is being handled
    let failures = attribute_sync
        .status
        .as_ref()
        .map_or(0, |status| status.consecutive_failures);
    Action::requeue(pacing::error_backoff(failures.saturating_add(1)))
}
