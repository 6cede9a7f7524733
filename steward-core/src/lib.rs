//! Crate with types and traits shared by every steward component
//!
//! This crate carries no store client and no runtime. It holds the object model
//! (metadata, owner references, conditions), the watch protocol events and the
//! error response shape used by resource stores.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod conditions;
pub use conditions::{Condition, ConditionStatus};

pub mod metadata;
pub use metadata::{ObjectMeta, OwnerReference, TypeMeta};

pub mod object;
pub use object::{DynamicObject, ObjectList, ObjectStatus, ParseSpecError};

pub mod params;
pub use params::ListParams;

mod resource;
pub use resource::{Resource, ResourceExt};

pub mod watch;
pub use watch::WatchEvent;

mod error;
pub use error::ErrorResponse;
