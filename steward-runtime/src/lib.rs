//! Crate with reconciliation runtime components
//!
//! This crate contains the core building blocks to allow users to build
//! controllers that continuously drive stored objects towards their declared state.
//!
//! Newcomers should generally get started with the [`Controller`] builder, which manages
//! the watches, caches, work queue, garbage collection and leadership gating for you.
//! Reconcilers are expected to be idempotent, and compose the helpers in [`finalizer`],
//! [`dependents`] and [`status`].

#![deny(unsafe_code)]
#![deny(clippy::all)]

pub mod controller;
pub mod coordination;
pub mod dependents;
pub mod error;
pub mod finalizer;
pub mod gc;
pub mod predicate;
pub mod queue;
pub mod reflector;
pub mod status;
pub mod utils;
pub mod watcher;

pub use controller::{Action, Controller, Mapper, Relation};
pub use coordination::{LeaderElector, LeaderState};
pub use error::{Classify, ErrorClass};
pub use finalizer::finalizer;
pub use gc::GarbageCollector;
pub use predicate::Predicate;
pub use queue::WorkQueue;
pub use reflector::{reflector, Store};
pub use utils::WatchStreamExt;
pub use watcher::watcher;
