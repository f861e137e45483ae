//! Writes the synced attribute onto a target object under optimistic concurrency.

use std::num::NonZeroU32;

use k8s_openapi::jiff::Timestamp;
use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;

use crate::store::{self, TargetStore, WriteOutcome};

/// Annotation stamped on every written target object, holding the time of the write.
pub const SYNC_TIME_ANNOTATION: &str = "attributesync.keycloak.appuio.io/sync-time";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("error fetching target object {name:?}"))]
    GetTarget { source: store::Error, name: String },

    #[snafu(display("unable to update target object {name:?}"))]
    UpdateFailed { source: store::Error, name: String },

    #[snafu(display("gave up updating target object {name:?} after {attempts} conflicting writes"))]
    ConflictRetriesExhausted { name: String, attempts: u32 },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    Applied,

    /// No target object exists (anymore), which is not an error.
    Skipped,
}

/// Limits how often a write is retried after losing a race against another writer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConflictPolicy {
    /// Maximum number of writes per target object, unlimited if [`None`].
    pub max_attempts: Option<NonZeroU32>,
}

/// The keys the attribute value is written to. Keys that are [`None`] are left untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetKeys<'a> {
    pub label: Option<&'a str>,
    pub annotation: Option<&'a str>,
}

pub struct ConflictRetryingUpdater<'a> {
    targets: &'a dyn TargetStore,
    policy: ConflictPolicy,
}

impl<'a> ConflictRetryingUpdater<'a> {
    pub fn new(targets: &'a dyn TargetStore, policy: ConflictPolicy) -> Self {
        Self { targets, policy }
    }

    /// Sets `value` on the target object `name`, retrying from a fresh read whenever the
    /// object was modified between read and write.
    pub async fn apply(
        &self,
        name: &str,
        value: &str,
        keys: TargetKeys<'_>,
    ) -> Result<ApplyOutcome, Error> {
        let mut conflicts = 0;

        loop {
            let Some(mut target) = self
                .targets
                .get(name)
                .await
                .context(GetTargetSnafu { name })?
            else {
                debug!(object.name = name, "no target object found - skipping");
                return Ok(ApplyOutcome::Skipped);
            };

            if let Some(key) = keys.annotation {
                target.annotations.insert(key.to_owned(), value.to_owned());
            }
            if let Some(key) = keys.label {
                target.labels.insert(key.to_owned(), value.to_owned());
            }
            target
                .annotations
                .insert(SYNC_TIME_ANNOTATION.to_owned(), Timestamp::now().to_string());

            match self
                .targets
                .update(&target)
                .await
                .context(UpdateFailedSnafu { name })?
            {
                WriteOutcome::Written => return Ok(ApplyOutcome::Applied),
                WriteOutcome::NotFound => {
                    debug!(object.name = name, "target object vanished - skipping");
                    return Ok(ApplyOutcome::Skipped);
                }
                WriteOutcome::Conflict => {
                    conflicts += 1;
                    if let Some(max_attempts) = self.policy.max_attempts {
                        ensure!(
                            conflicts < max_attempts.get(),
                            ConflictRetriesExhaustedSnafu {
                                name,
                                attempts: conflicts,
                            }
                        );
                    }
                    debug!(
                        object.name = name,
                        conflicts, "target object was modified concurrently - retrying"
                    );
                }
            }
        }
    }
}
