//! Crate for talking to a resource store
//!
//! The [`Client`] trait is the only boundary between the steward runtime and the store that
//! persists objects, serves list/watch and arbitrates leases. [`MemoryStore`] is a complete
//! in-process implementation of that boundary with the same optimistic concurrency,
//! generation and finalizer semantics, used by tests and demos.
//!
//! ```rust
//! use steward_client::{Client, MemoryStore};
//! use steward_core::{DynamicObject, ListParams};
//!
//! # async fn wrapper() -> Result<(), steward_client::Error> {
//! let store = MemoryStore::new();
//! let created = store.create(&DynamicObject::new("Replicated", "x").within("default")).await?;
//! assert_eq!(created.metadata.generation, Some(1));
//! let list = store.list("Replicated", &ListParams::default()).await?;
//! assert_eq!(list.items.len(), 1);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod client;
pub use client::{Client, DeleteOutcome, WatchStream};

pub mod error;
pub use error::Error;

pub mod lease;
pub use lease::Lease;

pub mod memory;
pub use memory::{MemoryStore, Verb};

pub use steward_core as core;

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
