//! Filters deciding which cache changes are worth a reconciliation
//!
//! Predicates are plain values: they hold no evaluation cache and have no side effects,
//! so the same predicate can be shared between relations and evaluated from any task.
use std::ops::Not;
use steward_core::{DynamicObject, ResourceExt};

/// A single change observed by a cache
#[derive(Clone, Copy, Debug)]
pub struct Change<'a> {
    /// The object before the change, `None` for creations and relist discoveries
    pub old: Option<&'a DynamicObject>,
    /// The object after the change, or its last known state for deletions
    pub new: &'a DynamicObject,
    /// Whether the object was removed
    pub deleted: bool,
}

impl<'a> Change<'a> {
    /// A change from `old` to `new`
    #[must_use]
    pub fn updated(old: &'a DynamicObject, new: &'a DynamicObject) -> Self {
        Self {
            old: Some(old),
            new,
            deleted: false,
        }
    }

    /// An object seen for the first time
    #[must_use]
    pub fn created(new: &'a DynamicObject) -> Self {
        Self {
            old: None,
            new,
            deleted: false,
        }
    }

    /// An object that left the store
    #[must_use]
    pub fn deleted(last: &'a DynamicObject) -> Self {
        Self {
            old: None,
            new: last,
            deleted: true,
        }
    }
}

/// A filter over [`Change`]s
///
/// The property predicates (`Generation`, `Labels`, `Annotations`, `ResourceVersion`, `Field`)
/// accept a change when the property differs between the old and the new object. Creations and
/// deletions carry no comparable old object and are always accepted by them.
///
/// ```
/// use steward_runtime::Predicate;
/// // reconcile on desired state changes, deletion requests, or a change of the replica count
/// let pred = Predicate::Generation
///     .or(Predicate::Deletion)
///     .or(Predicate::field("/status/readyReplicas"));
/// # drop(pred);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// `metadata.generation` changed, i.e. the desired state changed
    Generation,
    /// `metadata.labels` changed
    Labels,
    /// `metadata.annotations` changed
    Annotations,
    /// Any persisted change at all
    ResourceVersion,
    /// The object was deleted or started terminating
    Deletion,
    /// The value at a JSON pointer into the serialized object changed, e.g. `/spec/replicas`
    Field(String),
    /// Accept everything
    Always,
    /// Accept when every inner predicate accepts, `And(vec![])` accepts everything
    And(Vec<Predicate>),
    /// Accept when any inner predicate accepts, `Or(vec![])` accepts nothing
    Or(Vec<Predicate>),
    /// Invert the inner predicate
    Not(Box<Predicate>),
}

impl Default for Predicate {
    fn default() -> Self {
        Self::Always
    }
}

impl Predicate {
    /// Compare the value behind a JSON pointer
    #[must_use]
    pub fn field(pointer: &str) -> Self {
        Self::Field(pointer.to_string())
    }

    /// Combine with `other`, requiring both to accept
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut all) => {
                all.push(other);
                Self::And(all)
            }
            this => Self::And(vec![this, other]),
        }
    }

    /// Combine with `other`, requiring either to accept
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut any) => {
                any.push(other);
                Self::Or(any)
            }
            this => Self::Or(vec![this, other]),
        }
    }

    /// Whether `change` should trigger a reconciliation
    #[must_use]
    pub fn accept(&self, change: &Change<'_>) -> bool {
        match self {
            Self::Always => true,
            Self::And(all) => all.iter().all(|p| p.accept(change)),
            Self::Or(any) => any.iter().any(|p| p.accept(change)),
            Self::Not(inner) => !inner.accept(change),
            Self::Deletion => {
                change.deleted
                    || (change.new.is_terminating() && !change.old.is_some_and(ResourceExt::is_terminating))
            }
            Self::Generation => differs(change, |o| o.metadata.generation),
            Self::Labels => differs(change, |o| o.metadata.labels.clone()),
            Self::Annotations => differs(change, |o| o.metadata.annotations.clone()),
            Self::ResourceVersion => differs(change, |o| o.metadata.resource_version.clone()),
            Self::Field(pointer) => differs(change, |o| {
                serde_json::to_value(o)
                    .ok()
                    .and_then(|v| v.pointer(pointer).cloned())
            }),
        }
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Self::Output {
        match self {
            Self::Not(inner) => *inner,
            this => Self::Not(Box::new(this)),
        }
    }
}

fn differs<V: PartialEq>(change: &Change<'_>, property: impl Fn(&DynamicObject) -> V) -> bool {
    match change.old {
        Some(old) if !change.deleted => property(old) != property(change.new),
        _ => true,
    }
}
