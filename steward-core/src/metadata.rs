//! Metadata structs carried by every stored object.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type information that is flattened into every object
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TypeMeta {
    /// The version of the API
    pub api_version: String,

    /// The kind of the object
    pub kind: String,
}

impl TypeMeta {
    /// Construct type information for a kind under the default `v1` version
    #[must_use]
    pub fn kind(kind: &str) -> Self {
        Self {
            api_version: "v1".into(),
            kind: kind.into(),
        }
    }
}

/// Standard object metadata
///
/// `generation` is owned by the store and only moves when the desired state (`spec`) changes,
/// while `resource_version` moves on every persisted change and is used for optimistic concurrency.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Name, unique within a kind and namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Namespace, `None` for cluster-scoped objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Unique id assigned by the store on creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Sequence number of the desired state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    /// Opaque version marker of the last persisted change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Identifying labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Non-identifying annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Back-links to the objects responsible for this object's lifecycle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    /// Ordered set of tokens blocking final deletion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    /// Set once deletion has been requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Set by the store on creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// A back-link from a dependent object to its owner
#[derive(Deserialize, Serialize, Clone, Default, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    /// Kind of the owner
    pub kind: String,
    /// Name of the owner (same namespace as the dependent)
    pub name: String,
    /// Uid of the owner, distinguishing it from a later object with the same name
    pub uid: String,
    /// Whether this owner is the managing controller, at most one per object
    #[serde(default)]
    pub controller: bool,
    /// Whether deleting the owner must wait for this dependent to be gone
    #[serde(default)]
    pub block_owner_deletion: bool,
}

impl OwnerReference {
    /// Whether this reference points at the same owner as `other`, ignoring the flags
    #[must_use]
    pub fn same_owner(&self, other: &OwnerReference) -> bool {
        self.kind == other.kind && self.name == other.name && self.uid == other.uid
    }
}
