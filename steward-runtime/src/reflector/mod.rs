//! Caches objects in memory

mod object_ref;
/// The cache itself, written by one [`Writer`] and read through cloned [`Store`]s
pub mod store;

pub use self::object_ref::{Extra as ObjectRefExtra, ObjectRef};
pub use store::{store, Store, Writer, OWNER_UID_INDEX};

use crate::{predicate::Change, watcher};
use futures::{Stream, TryStreamExt};
use std::sync::Arc;
use steward_core::DynamicObject;

/// A change applied to a [`Store`]
///
/// `old` is the cached object before the change, `None` if the object was not cached.
/// For deletions `new` is the last known state of the object.
#[derive(Clone, Debug)]
pub struct Delta {
    /// The previously cached object
    pub old: Option<Arc<DynamicObject>>,
    /// The object after the change
    pub new: Arc<DynamicObject>,
    /// Whether the object left the store
    pub deleted: bool,
}

impl Delta {
    /// View this delta as a [`Change`] for predicate evaluation
    #[must_use]
    pub fn change(&self) -> Change<'_> {
        Change {
            old: self.old.as_deref(),
            new: &self.new,
            deleted: self.deleted,
        }
    }
}

/// Cache objects from a [`watcher()`](crate::watcher()) stream into a local [`Store`]
///
/// Observes the raw `Stream` of [`watcher::Event`] objects, and modifies the cache.
/// It passes the raw stream through unmodified.
///
/// ## Usage
/// Create a [`Store`] through [`store()`]. The `writer` part is not clonable,
/// and must be moved into the reflector. The `reader` part is the [`Store`] interface
/// that you can send to other parts of your program as state.
///
/// The cache contains the last-seen state of objects,
/// which may lag slightly behind the actual state.
///
/// ```no_run
/// use futures::TryStreamExt;
/// use std::sync::Arc;
/// use steward_client::MemoryStore;
/// use steward_runtime::{reflector, watcher, WatchStreamExt};
/// # async fn wrapper() -> Result<(), steward_runtime::watcher::Error> {
/// let client = Arc::new(MemoryStore::new());
/// let (reader, writer) = reflector::store();
/// let rf = reflector::reflector(
///     writer,
///     watcher(client, "Replica", watcher::Config::default().labels("app=web")),
/// );
/// // poll the stream to keep the store up to date
/// rf.default_backoff().try_for_each(|_| async { Ok(()) }).await?;
/// # drop(reader);
/// # Ok(())
/// # }
/// ```
pub fn reflector<W>(mut writer: Writer, stream: W) -> impl Stream<Item = W::Item>
where
    W: Stream<Item = watcher::Result<watcher::Event>>,
{
    stream.inspect_ok(move |event| {
        writer.apply_watcher_event(event);
    })
}
