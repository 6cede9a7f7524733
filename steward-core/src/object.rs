//! Generic object representation used by stores and the runtime.
use crate::{
    conditions::{self, Condition},
    metadata::{ObjectMeta, TypeMeta},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to parse the spec of {kind} {name}: {source}")]
/// The desired state of an object could not be read as the expected type
pub struct ParseSpecError {
    /// Kind of the offending object
    pub kind: String,
    /// Name of the offending object
    pub name: String,
    /// Underlying decoding failure
    #[source]
    pub source: serde_json::Error,
}

/// Observed state, written by controllers through the status write path only
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStatus {
    /// The generation most recently acted upon by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Conditions keyed by type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Any other kind-specific observations
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl ObjectStatus {
    /// Look up a condition by type
    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        conditions::find_condition(&self.conditions, type_)
    }

    /// Upsert a condition, see [`conditions::set_condition`]
    pub fn set_condition(&mut self, condition: Condition) -> bool {
        conditions::set_condition(&mut self.conditions, condition)
    }
}

/// A dynamic representation of a stored object
///
/// The desired state lives in `spec` as free-form JSON; use [`DynamicObject::parse_spec`]
/// to read it as a typed struct.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DynamicObject {
    /// The type fields
    #[serde(flatten)]
    pub types: TypeMeta,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state, owner-authored
    #[serde(default)]
    pub spec: serde_json::Value,
    /// Observed state, controller-authored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ObjectStatus>,
}

impl DynamicObject {
    /// Create an object of `kind` with the given name and an empty spec
    #[must_use]
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            types: TypeMeta::kind(kind),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            spec: serde_json::Value::Null,
            status: None,
        }
    }

    /// Attach a namespace
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// Attach a desired state
    #[must_use]
    pub fn spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    /// Attach a label
    #[must_use]
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Attempt to read the desired state as `T`
    pub fn parse_spec<T: DeserializeOwned>(&self) -> Result<T, ParseSpecError> {
        serde_json::from_value(self.spec.clone()).map_err(|source| ParseSpecError {
            kind: self.types.kind.clone(),
            name: self.metadata.name.clone().unwrap_or_default(),
            source,
        })
    }

    /// The status, inserting an empty one if missing
    pub fn status_mut(&mut self) -> &mut ObjectStatus {
        self.status.get_or_insert_with(ObjectStatus::default)
    }
}

/// A consistent snapshot of all objects of one kind
#[derive(Clone, Debug, Default)]
pub struct ObjectList {
    /// The objects
    pub items: Vec<DynamicObject>,
    /// Version marker to resume a watch from, right after this snapshot
    pub resource_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Deserialize, Debug)]
    struct Replicas {
        replicas: u32,
    }

    #[test]
    fn parse_spec_reads_typed_spec() {
        let obj = DynamicObject::new("Replicated", "x").spec(json!({ "replicas": 3 }));
        assert_eq!(obj.parse_spec::<Replicas>().unwrap().replicas, 3);
    }

    #[test]
    fn parse_spec_reports_malformed_spec() {
        let obj = DynamicObject::new("Replicated", "x").spec(json!({ "replicas": "three" }));
        let err = obj.parse_spec::<Replicas>().unwrap_err();
        assert_eq!(err.name, "x");
        assert_eq!(err.kind, "Replicated");
    }

    #[test]
    fn status_fields_are_flattened() {
        let mut obj = DynamicObject::new("Replica", "x-0");
        obj.status_mut().observed_generation = Some(2);
        obj.status_mut().fields.insert("ready".into(), json!(true));
        let value = serde_json::to_value(&obj).unwrap();
        assert_eq!(value["kind"], "Replica");
        assert_eq!(value["status"]["ready"], true);
        assert_eq!(value["status"]["observedGeneration"], 2);
        let back: DynamicObject = serde_json::from_value(value).unwrap();
        assert_eq!(back, obj);
    }
}
