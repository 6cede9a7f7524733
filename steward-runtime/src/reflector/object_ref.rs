use educe::Educe;
use steward_core::{OwnerReference, Resource, ResourceExt};
use std::fmt::{Display, Formatter};

/// A kinded and namespaced (if relevant) reference to an object
///
/// This is the work item of the controller queue: it identifies an object without carrying its
/// body, so the object is always re-read from the cache when the item is processed.
///
/// ```
/// use steward_runtime::reflector::ObjectRef;
/// assert_ne!(
///     ObjectRef::new("Replicated", "a"),
///     ObjectRef::new("Replica", "a"),
/// );
/// ```
#[derive(Educe, Clone, Debug, Eq)]
#[educe(PartialEq, Hash)]
#[non_exhaustive]
pub struct ObjectRef {
    /// The kind of the object
    pub kind: String,
    /// The name of the object
    pub name: String,
    /// The namespace of the object
    ///
    /// `None` for cluster-scoped objects. A namespaced and a cluster-scoped reference are
    /// never equal:
    ///
    /// ```
    /// # use steward_runtime::reflector::ObjectRef;
    /// assert_ne!(ObjectRef::new("Replicated", "foo"), ObjectRef::new("Replicated", "foo").within("bar"));
    /// ```
    pub namespace: Option<String>,
    /// Extra information about the object being referred to
    ///
    /// This is *not* considered when comparing objects, but may be used when converting to and
    /// from other representations, such as [`OwnerReference`].
    #[educe(Hash(ignore), PartialEq(ignore))]
    pub extra: Extra,
}

/// Non-vital information about an object being referred to
///
/// See [`ObjectRef::extra`].
#[derive(Default, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Extra {
    /// The version of the resource at the time of reference
    pub resource_version: Option<String>,
    /// The uid of the object
    pub uid: Option<String>,
}

impl ObjectRef {
    /// Reference a cluster-scoped object, or start building a namespaced one
    #[must_use]
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: None,
            extra: Extra::default(),
        }
    }

    /// Place the reference in a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Creates `ObjectRef` from the resource
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            kind: obj.kind().to_string(),
            name: obj.name_any(),
            namespace: meta.namespace.clone(),
            extra: Extra {
                resource_version: meta.resource_version.clone(),
                uid: meta.uid.clone(),
            },
        }
    }

    /// Create an `ObjectRef` from an `OwnerReference`
    ///
    /// Owners always live in the namespace of their dependents.
    #[must_use]
    pub fn from_owner_ref(namespace: Option<&str>, owner: &OwnerReference) -> Self {
        Self {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            namespace: namespace.map(String::from),
            extra: Extra {
                resource_version: None,
                uid: Some(owner.uid.clone()),
            },
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}
