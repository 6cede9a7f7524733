//! Finalizer helper for [`Controller`](crate::Controller) reconcilers
use crate::{
    controller::Action,
    error::{Classify, ErrorClass},
};
use futures::{TryFuture, TryFutureExt};
use std::{error::Error as StdError, sync::Arc};
use steward_client::{Client, Error as ClientError};
use steward_core::{DynamicObject, ResourceExt};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
/// Failures of a [`finalizer`] pass
pub enum Error<ReconcileErr>
where
    ReconcileErr: StdError + 'static,
{
    /// The apply reconciliation failed
    #[error("failed to apply object: {0}")]
    ApplyFailed(#[source] ReconcileErr),
    /// The cleanup reconciliation failed, the finalizer was kept
    #[error("failed to clean up object: {0}")]
    CleanupFailed(#[source] ReconcileErr),
    /// Persisting the added finalizer failed
    #[error("failed to add finalizer: {0}")]
    AddFinalizer(#[source] ClientError),
    /// Persisting the removed finalizer failed
    #[error("failed to remove finalizer: {0}")]
    RemoveFinalizer(#[source] ClientError),
    /// The object has no name to write back to
    #[error("object has no name")]
    UnnamedObject,
}

impl<E: StdError + Classify + 'static> Classify for Error<E> {
    fn class(&self) -> ErrorClass {
        match self {
            Error::ApplyFailed(err) | Error::CleanupFailed(err) => err.class(),
            Error::AddFinalizer(err) | Error::RemoveFinalizer(err) => err.class(),
            Error::UnnamedObject => ErrorClass::Permanent,
        }
    }
}

/// Where an object stands relative to one finalizer token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerState {
    /// Live and without the token, it has to be added before anything else happens
    NoFinalizer,
    /// Live and guarded by the token
    Finalized,
    /// Terminating with the token still present, cleanup has to run
    CleaningUp,
    /// Terminating and the token is gone, nothing is left to do
    Removed,
}

impl FinalizerState {
    /// Compute the state of `obj` for the token `finalizer_name`
    #[must_use]
    pub fn for_object(obj: &DynamicObject, finalizer_name: &str) -> Self {
        let has_finalizer = obj.finalizers().iter().any(|fin| fin == finalizer_name);
        match (has_finalizer, obj.is_terminating()) {
            (false, false) => Self::NoFinalizer,
            (true, false) => Self::Finalized,
            (true, true) => Self::CleaningUp,
            (false, true) => Self::Removed,
        }
    }
}

/// Reconcile an object in a way that requires cleanup before an object can be deleted.
///
/// It does this by managing a `metadata.finalizers` entry,
/// which prevents the object from being purged before the cleanup is done.
///
/// In typical usage, if you use `finalizer` then it should be the only top-level "action"
/// in your [`Controller`](crate::Controller)'s `reconcile` function.
///
/// # Expected Flow
///
/// 1. User creates object
/// 2. Reconciler sees object
/// 3. `finalizer` adds `finalizer_name` to the finalizers and asks for an immediate requeue
/// 4. Reconciler sees updated object
/// 5. `finalizer` runs [`Event::Apply`]
/// 6. User deletes object, the store marks it terminating
/// 7. Reconciler sees terminating object
/// 8. `finalizer` runs [`Event::Cleanup`]
/// 9. `finalizer` removes `finalizer_name` and only that token
/// 10. The store sees that all finalizers are gone and purges the object
///
/// # Guarantees
///
/// If [`Event::Apply`] is ever started then [`Event::Cleanup`] must succeed before the object is purged.
/// Tokens owned by other controllers are never touched.
///
/// # Assumptions
///
/// `finalizer_name` must be unique among the controllers interacting with the object.
///
/// [`Event::Apply`] and [`Event::Cleanup`] must both be idempotent, and tolerate being executed several times (even if previously cancelled).
///
/// [`Event::Cleanup`] must tolerate [`Event::Apply`] never having ran at all, or never having succeeded.
///
/// # Errors
///
/// [`Event::Apply`] and [`Event::Cleanup`] are both fallible, their errors are passed through as [`Error::ApplyFailed`]
/// and [`Error::CleanupFailed`], respectively.
///
/// Adding and removing the finalizer are optimistic writes against the version of `obj`, so they fail
/// with a conflict if the object changed in the meantime. The conflict is retried on a fresh read.
pub async fn finalizer<ReconcileFut>(
    client: &dyn Client,
    finalizer_name: &str,
    obj: Arc<DynamicObject>,
    reconcile: impl FnOnce(Event) -> ReconcileFut,
) -> Result<Action, Error<ReconcileFut::Error>>
where
    ReconcileFut: TryFuture<Ok = Action>,
    ReconcileFut::Error: StdError + 'static,
{
    match FinalizerState::for_object(&obj, finalizer_name) {
        FinalizerState::Finalized => reconcile(Event::Apply(obj))
            .into_future()
            .await
            .map_err(Error::ApplyFailed),
        FinalizerState::CleaningUp => {
            obj.metadata.name.as_ref().ok_or(Error::UnnamedObject)?;
            let action = reconcile(Event::Cleanup(obj.clone()))
                .into_future()
                .await
                // Short-circuit, so that we keep the finalizer if cleanup fails
                .map_err(Error::CleanupFailed)?;
            let mut updated = (*obj).clone();
            updated.finalizers_mut().retain(|fin| fin != finalizer_name);
            client.replace(&updated).await.map_err(Error::RemoveFinalizer)?;
            debug!(finalizer = finalizer_name, "cleanup done, removed finalizer");
            Ok(action)
        }
        FinalizerState::NoFinalizer => {
            obj.metadata.name.as_ref().ok_or(Error::UnnamedObject)?;
            let mut updated = (*obj).clone();
            updated.finalizers_mut().push(finalizer_name.to_string());
            client.replace(&updated).await.map_err(Error::AddFinalizer)?;
            debug!(finalizer = finalizer_name, "added finalizer");
            // apply only once the guarded version has been observed
            Ok(Action::RequeueImmediate)
        }
        // Our work here is done
        FinalizerState::Removed => Ok(Action::Done),
    }
}

/// A representation of an action that should be taken by a reconciler.
#[derive(Clone, Debug)]
pub enum Event {
    /// The reconciler should ensure that the actual state matches the state desired in the object.
    ///
    /// This must be idempotent, since it may be recalled if, for example:
    ///
    /// - The controller is restarted
    /// - The object is updated
    /// - The reconciliation fails
    Apply(Arc<DynamicObject>),
    /// The object is being deleted, and the reconciler should remove all resources that it owns.
    ///
    /// This must be idempotent, since it may be recalled if, for example:
    ///
    /// - The controller is restarted while the deletion is in progress
    /// - The reconciliation fails
    /// - Another finalizer was removed in the meantime
    Cleanup(Arc<DynamicObject>),
}
