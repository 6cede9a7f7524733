//! Idempotent writes of owned objects
//!
//! [`apply_dependent`] reads the current dependent, merges the desired state into it and only
//! writes when something actually differs, so a reconciler can call it on every pass without
//! generating store traffic once the world has converged.
use crate::error::{Classify, ErrorClass};
use steward_client::{Client, Error as ClientError};
use steward_core::{DynamicObject, OwnerReference, Resource, ResourceExt};
use thiserror::Error;
use tracing::debug;

/// Failures of [`apply_dependent`]
#[derive(Debug, Error)]
pub enum Error {
    /// A store call failed
    #[error("store request failed: {0}")]
    Client(#[from] ClientError),
    /// The owner has not been persisted yet
    #[error("owner {0} has no uid")]
    MissingOwnerUid(String),
    /// The dependent is already controlled by another owner
    #[error("{kind} {name} is controlled by {controller}")]
    NotOwned {
        /// Kind of the dependent
        kind: String,
        /// Name of the dependent
        name: String,
        /// Name of the controlling owner
        controller: String,
    },
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::Client(err) => match err.class() {
                // only a vanished primary counts as done, a dependent vanishing mid-write is retried
                ErrorClass::NotFound => ErrorClass::Transient,
                class => class,
            },
            Error::MissingOwnerUid(_) | Error::NotOwned { .. } => ErrorClass::Permanent,
        }
    }
}

/// What [`apply_dependent`] had to do
#[derive(Clone, Debug, PartialEq)]
pub enum Applied {
    /// The dependent did not exist
    Created(DynamicObject),
    /// The dependent drifted and was rewritten
    Updated(DynamicObject),
    /// The dependent already matched, nothing was written
    Unchanged(DynamicObject),
}

impl Applied {
    /// The dependent as stored after the call
    #[must_use]
    pub fn object(&self) -> &DynamicObject {
        match self {
            Applied::Created(obj) | Applied::Updated(obj) | Applied::Unchanged(obj) => obj,
        }
    }

    /// Whether a write happened
    #[must_use]
    pub fn changed(&self) -> bool {
        !matches!(self, Applied::Unchanged(_))
    }
}

/// Make the stored dependent match `desired`, owned by `owner`
///
/// The dependent always carries a controller owner reference to `owner`. Labels and
/// annotations of `desired` are merged over the current ones, the spec is replaced. The
/// dependent lands in the namespace of `owner` unless `desired` names one.
///
/// # Errors
///
/// Fails with [`Error::NotOwned`] when another object controls the dependent, and passes
/// store failures through, including conflicts from racing writers.
#[tracing::instrument(skip_all, fields(owner = %owner.name_any(), dependent = %desired.name_any()))]
pub async fn apply_dependent(
    client: &dyn Client,
    owner: &DynamicObject,
    mut desired: DynamicObject,
) -> Result<Applied, Error> {
    let owner_ref = owner
        .controller_owner_ref()
        .ok_or_else(|| Error::MissingOwnerUid(owner.name_any()))?;
    if desired.metadata.namespace.is_none() {
        desired.metadata.namespace = owner.metadata.namespace.clone();
    }
    let name = desired.name_any();
    let current = client
        .get_opt(desired.kind(), desired.metadata.namespace.as_deref(), &name)
        .await?;
    let Some(current) = current else {
        stamp_owner(&mut desired.metadata.owner_references, owner_ref);
        let created = client.create(&desired).await?;
        debug!("created dependent");
        return Ok(Applied::Created(created));
    };

    if let Some(controller) = current.controller_ref() {
        if !controller.same_owner(&owner_ref) {
            return Err(Error::NotOwned {
                kind: current.kind().to_string(),
                name,
                controller: controller.name.clone(),
            });
        }
    }
    let mut next = current.clone();
    next.metadata.labels.extend(desired.metadata.labels);
    next.metadata.annotations.extend(desired.metadata.annotations);
    next.spec = desired.spec;
    stamp_owner(&mut next.metadata.owner_references, owner_ref);
    if next == current {
        return Ok(Applied::Unchanged(current));
    }
    let updated = client.replace(&next).await?;
    debug!("updated dependent");
    Ok(Applied::Updated(updated))
}

/// Insert `owner`, replacing an existing reference to the same owner in place
fn stamp_owner(owners: &mut Vec<OwnerReference>, owner: OwnerReference) {
    match owners.iter_mut().find(|existing| existing.same_owner(&owner)) {
        Some(existing) => *existing = owner,
        None => owners.push(owner),
    }
}
