//! Reports the outcome of every AttributeSync reconciliation to the operator log and, for
//! failures caused by the AttributeSync itself, as an event on the AttributeSync.

use std::error::Error;

use kube::{
    Client,
    core::DynamicObject,
    runtime::{
        controller::{self as runtime, Action},
        reflector::ObjectRef,
    },
};
use tracing::{error, info};

use crate::{
    controller::{self, FULL_CONTROLLER_NAME},
    crd::AttributeSync,
    logging::k8s_events::publish_controller_error_as_k8s_event,
};

/// Error types that can be reported as an event on the reconciled object.
pub trait ReconcilerError: Error {
    /// `PascalCase` name of the error kind, used as event reason.
    fn category(&self) -> &'static str;

    /// Another object the error is about, such as the credentials
    /// [`Secret`](k8s_openapi::api::core::v1::Secret) that could not be read.
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }
}

pub type ReconcileResult<QueueErr> =
    Result<(ObjectRef<AttributeSync>, Action), runtime::Error<controller::Error, QueueErr>>;

/// Logs a finished reconciliation. Failures of a sync are also published as event.
pub fn report_reconciled<QueueErr>(client: &Client, result: &ReconcileResult<QueueErr>)
where
    QueueErr: Error + 'static,
{
    match result {
        Ok((attribute_sync, action)) => {
            info!(
                controller.name = FULL_CONTROLLER_NAME,
                attribute_sync = %attribute_sync,
                next = ?action,
                "reconciled AttributeSync"
            );
        }
        Err(err) => {
            error!(
                controller.name = FULL_CONTROLLER_NAME,
                error.category = failure_category(err),
                error = err as &dyn Error,
                "failed to reconcile AttributeSync"
            );
            publish_controller_error_as_k8s_event(client, FULL_CONTROLLER_NAME, err);
        }
    }
}

/// Failed syncs are categorized by what went wrong, runtime failures by their kind.
fn failure_category<QueueErr>(err: &runtime::Error<controller::Error, QueueErr>) -> &'static str {
    match err {
        runtime::Error::ReconcilerFailed(err, _) => err.category(),
        runtime::Error::ObjectNotFound(_) => "ObjectNotFound",
        runtime::Error::QueueError(_) => "QueueError",
        runtime::Error::RunnerError(_) => "RunnerError",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd;

    fn object() -> ObjectRef<DynamicObject> {
        ObjectRef::<AttributeSync>::new("sync-organization")
            .within("myapp")
            .erase()
    }

    #[test]
    fn failed_sync_uses_error_category() {
        let err: runtime::Error<_, std::io::Error> = runtime::Error::ReconcilerFailed(
            controller::Error::ResolveConfig {
                source: crd::Error::ObjectHasNoNamespace {
                    name: "sync-organization".to_owned(),
                },
            },
            object(),
        );

        assert_eq!(failure_category(&err), "ResolveConfig");
    }

    #[test]
    fn runtime_failures_use_their_kind() {
        let err: runtime::Error<controller::Error, std::io::Error> =
            runtime::Error::ObjectNotFound(object());
        assert_eq!(failure_category(&err), "ObjectNotFound");

        let err: runtime::Error<controller::Error, std::io::Error> =
            runtime::Error::QueueError(std::io::Error::other("watch stream closed"));
        assert_eq!(failure_category(&err), "QueueError");
    }
}
