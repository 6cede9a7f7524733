use crate::{
    metadata::{ObjectMeta, OwnerReference},
    object::DynamicObject,
};
use std::collections::BTreeMap;

/// An accessor trait for a stored object.
///
/// Every object has metadata and a kind. Objects that have been persisted by a store
/// should all have:
/// - `.metadata.name`
/// - `.metadata.uid`
/// - `.metadata.resource_version`
///
/// This avoids a bunch of the unnecessary unwrap mechanics for apps.
pub trait Resource {
    /// Returns the kind of this object
    fn kind(&self) -> &str;

    /// Metadata that all persisted objects must have
    fn meta(&self) -> &ObjectMeta;
    /// Metadata that all persisted objects must have
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Generates a controller owner reference pointing to this object
    ///
    /// Note: this returns an `Option`, but for objects populated from a store,
    /// this Option can be safely unwrapped.
    fn controller_owner_ref(&self) -> Option<OwnerReference> {
        let meta = self.meta();
        Some(OwnerReference {
            kind: self.kind().to_string(),
            name: meta.name.clone()?,
            uid: meta.uid.clone()?,
            controller: true,
            block_owner_deletion: true,
        })
    }
}

impl Resource for DynamicObject {
    fn kind(&self) -> &str {
        &self.types.kind
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Helper methods for objects.
pub trait ResourceExt: Resource {
    /// Returns the name of the object, or an empty string if unset
    fn name_any(&self) -> String;
    /// The namespace the object is in
    fn namespace(&self) -> Option<String>;
    /// The resource version
    fn resource_version(&self) -> Option<String>;
    /// Unique ID (if you delete the object and then create a new object with the same name, it will have different ID)
    fn uid(&self) -> Option<String>;
    /// Returns the generation, `0` if unset
    fn generation(&self) -> i64;
    /// Returns the labels of the object
    fn labels(&self) -> &BTreeMap<String, String>;
    /// Returns the annotations of the object
    fn annotations(&self) -> &BTreeMap<String, String>;
    /// Returns the owner references of the object
    fn owner_references(&self) -> &[OwnerReference];
    /// The owner reference marked as controller, if any
    fn controller_ref(&self) -> Option<&OwnerReference>;
    /// Returns the finalizers of the object
    fn finalizers(&self) -> &[String];
    /// Provides mutable access to the finalizers
    fn finalizers_mut(&mut self) -> &mut Vec<String>;
    /// Whether deletion has been requested
    fn is_terminating(&self) -> bool;
}

impl<K: Resource> ResourceExt for K {
    fn name_any(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    fn resource_version(&self) -> Option<String> {
        self.meta().resource_version.clone()
    }

    fn uid(&self) -> Option<String> {
        self.meta().uid.clone()
    }

    fn generation(&self) -> i64 {
        self.meta().generation.unwrap_or(0)
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        &self.meta().labels
    }

    fn annotations(&self) -> &BTreeMap<String, String> {
        &self.meta().annotations
    }

    fn owner_references(&self) -> &[OwnerReference] {
        &self.meta().owner_references
    }

    fn controller_ref(&self) -> Option<&OwnerReference> {
        self.meta().owner_references.iter().find(|owner| owner.controller)
    }

    fn finalizers(&self) -> &[String] {
        &self.meta().finalizers
    }

    fn finalizers_mut(&mut self) -> &mut Vec<String> {
        &mut self.meta_mut().finalizers
    }

    fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_owner_ref_needs_persisted_identity() {
        let mut obj = DynamicObject::new("Replicated", "x");
        assert!(obj.controller_owner_ref().is_none());
        obj.metadata.uid = Some("u-1".into());
        let owner = obj.controller_owner_ref().unwrap();
        assert_eq!(owner.kind, "Replicated");
        assert_eq!(owner.uid, "u-1");
        assert!(owner.controller);
    }

    #[test]
    fn controller_ref_finds_the_controlling_owner() {
        let mut obj = DynamicObject::new("Replica", "x-0");
        obj.metadata.owner_references = vec![
            OwnerReference {
                kind: "Team".into(),
                name: "a".into(),
                uid: "1".into(),
                ..OwnerReference::default()
            },
            OwnerReference {
                kind: "Replicated".into(),
                name: "x".into(),
                uid: "2".into(),
                controller: true,
                ..OwnerReference::default()
            },
        ];
        assert_eq!(obj.controller_ref().map(|o| o.uid.as_str()), Some("2"));
    }
}
