use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use steward_core::{DynamicObject, ListParams, ObjectList, WatchEvent};

use crate::{lease::Lease, Result};

/// Stream of raw events returned by [`Client::watch`]
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// What a [`Client::delete`] call did
#[derive(Clone, Debug, PartialEq)]
pub enum DeleteOutcome {
    /// The object had finalizers, it is now terminating and still present
    Terminating(DynamicObject),
    /// The object was removed from the store
    Purged(DynamicObject),
}

/// Interface of a resource store.
///
/// All writes are validated by the store:
/// - `replace` and `replace_status` reject a stale `metadata.resource_version` with a 409 `Conflict`
/// - `replace` never touches `status`, `replace_status` never touches anything but `status`
/// - `generation` is bumped by the store whenever `spec` changes
/// - `delete` only marks an object with finalizers as terminating; it is purged once a
///   `replace` empties its finalizers
#[async_trait]
pub trait Client: Send + Sync + 'static {
    /// Snapshot all objects of `kind` matching `lp`
    async fn list(&self, kind: &str, lp: &ListParams) -> Result<ObjectList>;

    /// Stream changes to objects of `kind` that happened after `version`
    ///
    /// If `version` is no longer retained the stream yields a single
    /// [`WatchEvent::Error`] with code 410, and a fresh [`Client::list`] is required.
    async fn watch(&self, kind: &str, lp: &ListParams, version: &str) -> Result<WatchStream>;

    /// Get a single object
    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<DynamicObject>;

    /// Create an object, failing with `AlreadyExists` on a name collision
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace metadata and spec of an existing object
    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace the status of an existing object
    async fn replace_status(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Request deletion of an object
    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<DeleteOutcome>;

    /// Try to take (or keep) the lease `name` for `holder`
    ///
    /// Returns `false` if another holder has an unexpired claim.
    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Extend a lease held by `holder`, returns `false` if the lease was lost
    async fn renew_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Voluntarily give up a lease held by `holder`
    async fn release_lease(&self, name: &str, holder: &str) -> Result<bool>;

    /// Inspect a lease
    async fn get_lease(&self, name: &str) -> Result<Option<Lease>>;

    /// Get a single object, mapping `NotFound` to `None`
    async fn get_opt(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>> {
        match self.get(kind, namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}
