//! Records the outcome of every reconciliation as conditions on the [`AttributeSync`] status.

use std::str::FromStr;

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    jiff::Timestamp,
};
use kube::ResourceExt;
use strum::{EnumCount, EnumString, IntoStaticStr};
use tracing::error;

use crate::{crd::AttributeSync, logging::error_chain, store::StatusStore};

pub const STATUS_TRUE: &str = "True";
pub const REASON_SUCCEEDED: &str = "LastReconcileCycleSucceeded";
pub const REASON_FAILED: &str = "LastReconcileCycleFailed";

#[derive(
    Clone, Copy, Debug, EnumCount, EnumString, Eq, Hash, IntoStaticStr, Ord, PartialEq, PartialOrd,
)]
pub enum SyncConditionType {
    /// The last reconciliation completed successfully.
    Success,

    /// The last reconciliation failed, the message holds the error.
    Error,
}

/// Helper struct to replace conditions by their type.
#[derive(Clone, Debug, Default)]
pub struct SyncConditionSet {
    // Each SyncConditionType has its fixed position, which keeps the order stable and prevents
    // storing a condition under a different type than its own. See "put".
    conditions: [Option<Condition>; SyncConditionType::COUNT],

    /// Conditions not managed by this controller, passed through untouched.
    foreign: Vec<Condition>,
}

impl SyncConditionSet {
    /// Adds a condition of the given type, replacing the previous one of that type.
    pub fn put(&mut self, type_: SyncConditionType, mut condition: Condition) {
        condition.type_ = <&str>::from(type_).to_owned();
        self.conditions[type_ as usize] = Some(condition);
    }

    pub fn get(&self, type_: SyncConditionType) -> Option<&Condition> {
        self.conditions[type_ as usize].as_ref()
    }
}

impl From<Vec<Condition>> for SyncConditionSet {
    fn from(conditions: Vec<Condition>) -> Self {
        let mut set = Self::default();
        for condition in conditions {
            match SyncConditionType::from_str(&condition.type_) {
                Ok(type_) => set.conditions[type_ as usize] = Some(condition),
                Err(_) => set.foreign.push(condition),
            }
        }
        set
    }
}

impl From<SyncConditionSet> for Vec<Condition> {
    fn from(set: SyncConditionSet) -> Self {
        set.conditions.into_iter().flatten().chain(set.foreign).collect()
    }
}

/// Builds a condition of `type_` for the current generation of `attribute_sync`.
pub fn build_condition(
    attribute_sync: &AttributeSync,
    type_: SyncConditionType,
    message: String,
    now: Timestamp,
) -> Condition {
    let reason = match type_ {
        SyncConditionType::Success => REASON_SUCCEEDED,
        SyncConditionType::Error => REASON_FAILED,
    };

    Condition {
        last_transition_time: Time(now),
        message,
        observed_generation: attribute_sync.metadata.generation,
        reason: reason.to_owned(),
        status: STATUS_TRUE.to_owned(),
        type_: <&str>::from(type_).to_owned(),
    }
}

/// Puts `condition` into the status of `attribute_sync`. A success stamps the last successful
/// sync time and resets the failure count, a failure increments it.
pub fn set_condition(
    attribute_sync: &mut AttributeSync,
    type_: SyncConditionType,
    condition: Condition,
) {
    let status = attribute_sync.status.get_or_insert_with(Default::default);

    match type_ {
        SyncConditionType::Success => {
            status.last_sync_success_time = Some(condition.last_transition_time.clone());
            status.consecutive_failures = 0;
        }
        SyncConditionType::Error => {
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        }
    }

    let mut conditions = SyncConditionSet::from(std::mem::take(&mut status.conditions));
    conditions.put(type_, condition);
    status.conditions = conditions.into();
}

pub struct ConditionTracker<'a> {
    status: &'a dyn StatusStore,
}

impl<'a> ConditionTracker<'a> {
    pub fn new(status: &'a dyn StatusStore) -> Self {
        Self { status }
    }

    pub async fn record_success(&self, attribute_sync: &mut AttributeSync) {
        let condition = build_condition(
            attribute_sync,
            SyncConditionType::Success,
            String::new(),
            Timestamp::now(),
        );
        set_condition(attribute_sync, SyncConditionType::Success, condition);
        self.persist(attribute_sync).await;
    }

    pub async fn record_failure(
        &self,
        attribute_sync: &mut AttributeSync,
        reason: &(dyn std::error::Error + Send + Sync + 'static),
    ) {
        let condition = build_condition(
            attribute_sync,
            SyncConditionType::Error,
            error_chain(reason),
            Timestamp::now(),
        );
        set_condition(attribute_sync, SyncConditionType::Error, condition);
        self.persist(attribute_sync).await;
    }

    /// The status is informational only, failing to persist it does not fail the sync.
    async fn persist(&self, attribute_sync: &AttributeSync) {
        if let Err(err) = self.status.update(attribute_sync).await {
            error!(
                attribute_sync.name = attribute_sync.name_any(),
                error = &err as &dyn std::error::Error,
                "unable to update status"
            );
        }
    }
}
