use super::{Delta, ObjectRef};
use crate::watcher;
use ahash::{AHashMap, AHashSet};
use async_broadcast::{InactiveReceiver, Receiver, Sender};
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use steward_core::{DynamicObject, ResourceExt};
use thiserror::Error;
use tokio::sync::watch;

/// Name of the built-in index mapping an owner uid to its dependents
pub const OWNER_UID_INDEX: &str = "owner-uid";

const DISPATCH_BUFFER: usize = 1024;

type IndexFn = Arc<dyn Fn(&DynamicObject) -> Vec<String> + Send + Sync>;
type Index = AHashMap<String, AHashSet<ObjectRef>>;

#[derive(Default)]
struct Cache {
    objects: AHashMap<ObjectRef, Arc<DynamicObject>>,
    indices: AHashMap<String, Index>,
}

impl Cache {
    fn insert(&mut self, indexers: &[(String, IndexFn)], key: ObjectRef, obj: Arc<DynamicObject>) -> Option<Arc<DynamicObject>> {
        let old = self.objects.insert(key.clone(), obj.clone());
        if let Some(old) = &old {
            self.unindex(indexers, &key, old);
        }
        for (name, index_fn) in indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in index_fn(&obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
        old
    }

    fn remove(&mut self, indexers: &[(String, IndexFn)], key: &ObjectRef) -> Option<Arc<DynamicObject>> {
        let old = self.objects.remove(key)?;
        self.unindex(indexers, key, &old);
        Some(old)
    }

    fn unindex(&mut self, indexers: &[(String, IndexFn)], key: &ObjectRef, obj: &DynamicObject) {
        for (name, index_fn) in indexers {
            let Some(index) = self.indices.get_mut(name) else { continue };
            for value in index_fn(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }
}

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple reflectors.
/// In particular, relists will clobber the state of other connected reflectors.
pub struct Writer {
    cache: Arc<RwLock<Cache>>,
    indexers: Vec<(String, IndexFn)>,
    buffer: Option<AHashMap<ObjectRef, Arc<DynamicObject>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    dispatch_tx: Sender<Delta>,
    dispatch_rx: InactiveReceiver<Delta>,
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("indexers", &self.indexers.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .field("ready", &*self.ready_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl Writer {
    /// Creates a new Writer with the built-in [`OWNER_UID_INDEX`]
    #[must_use]
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (mut dispatch_tx, dispatch_rx) = async_broadcast::broadcast(DISPATCH_BUFFER);
        // slow subscribers lose old deltas rather than stall ingestion
        dispatch_tx.set_overflow(true);
        Writer {
            cache: Arc::default(),
            indexers: Vec::new(),
            buffer: None,
            ready_tx,
            ready_rx,
            dispatch_tx,
            dispatch_rx: dispatch_rx.deactivate(),
        }
        .with_indexer(OWNER_UID_INDEX, |obj| {
            obj.owner_references().iter().map(|owner| owner.uid.clone()).collect()
        })
    }

    /// Maintain an extra index, queried with [`Store::by_index`]
    #[must_use]
    pub fn with_indexer(
        mut self,
        name: &str,
        index_fn: impl Fn(&DynamicObject) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.indexers.push((name.to_string(), Arc::new(index_fn)));
        self
    }

    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store {
        Store {
            cache: self.cache.clone(),
            ready: self.ready_rx.clone(),
        }
    }

    /// Receive every [`Delta`] this writer applies from now on
    ///
    /// Subscribers that fall behind by more than the buffer lose the oldest deltas.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<Delta> {
        self.dispatch_rx.activate_cloned()
    }

    /// Applies a single watcher event to the store, returning the resulting changes
    ///
    /// During a relist (`Init` .. `InitDone`) the listed objects are buffered and swapped in
    /// atomically at `InitDone`, which produces deletions for objects that vanished and
    /// applies for objects that drifted while the watch was down.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event) -> Vec<Delta> {
        let deltas = match event {
            watcher::Event::Apply(obj) => {
                let key = ObjectRef::from_obj(obj);
                let new = Arc::new(obj.clone());
                let old = self.cache.write().insert(&self.indexers, key, new.clone());
                match old {
                    Some(old) if old.resource_version() == new.resource_version() => vec![],
                    old => vec![Delta {
                        old,
                        new,
                        deleted: false,
                    }],
                }
            }
            watcher::Event::Delete(obj) => {
                let key = ObjectRef::from_obj(obj);
                let old = self.cache.write().remove(&self.indexers, &key);
                vec![Delta {
                    old,
                    new: Arc::new(obj.clone()),
                    deleted: true,
                }]
            }
            watcher::Event::Init => {
                self.buffer = Some(AHashMap::new());
                vec![]
            }
            watcher::Event::InitApply(obj) => {
                let buffer = self.buffer.get_or_insert_with(AHashMap::new);
                buffer.insert(ObjectRef::from_obj(obj), Arc::new(obj.clone()));
                vec![]
            }
            watcher::Event::InitDone => {
                let listed = self.buffer.take().unwrap_or_default();
                let mut next = Cache::default();
                let mut cache = self.cache.write();
                let mut deltas = cache
                    .objects
                    .iter()
                    .filter(|(key, _)| !listed.contains_key(*key))
                    .map(|(_, old)| Delta {
                        old: Some(old.clone()),
                        new: old.clone(),
                        deleted: true,
                    })
                    .collect::<Vec<_>>();
                for (key, new) in listed {
                    match cache.objects.get(&key) {
                        Some(old) if old.resource_version() == new.resource_version() => {}
                        old => deltas.push(Delta {
                            old: old.cloned(),
                            new: new.clone(),
                            deleted: false,
                        }),
                    }
                    next.insert(&self.indexers, key, new);
                }
                *cache = next;
                drop(cache);
                self.ready_tx.send_replace(true);
                deltas
            }
        };
        for delta in &deltas {
            // no active subscribers is fine
            let _ = self.dispatch_tx.try_broadcast(delta.clone());
        }
        deltas
    }
}

/// The [`Writer`] was dropped before the store became ready
#[derive(Debug, Error)]
#[error("writer was dropped before store became ready")]
pub struct WriterDropped;

/// A readable cache of objects of one kind
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
#[derive(Clone)]
pub struct Store {
    cache: Arc<RwLock<Cache>>,
    ready: watch::Receiver<bool>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Store {
    /// Retrieve the entry referred to by `key`, if it is in the cache.
    ///
    /// `key.namespace` is ignored for cluster-scoped objects.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted in the store, and new objects may not yet exist in the cache.
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<DynamicObject>> {
        let cache = self.cache.read();
        cache
            .objects
            .get(key)
            // Try to erase the namespace and try again, in case the object is cluster-scoped
            .or_else(|| {
                cache.objects.get(&{
                    let mut cluster_key = key.clone();
                    cluster_key.namespace = None;
                    cluster_key
                })
            })
            .cloned()
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<DynamicObject>> {
        self.cache.read().objects.values().cloned().collect()
    }

    /// Objects whose index `index` produced `value`
    #[must_use]
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<DynamicObject>> {
        let cache = self.cache.read();
        cache
            .indices
            .get(index)
            .and_then(|index| index.get(value))
            .into_iter()
            .flatten()
            .filter_map(|key| cache.objects.get(key).cloned())
            .collect()
    }

    /// Return the number of elements in the store
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().objects.len()
    }

    /// Return whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the first full list has been applied
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait for the store to be populated by the first full list
    ///
    /// # Errors
    ///
    /// Returns [`WriterDropped`] if the [`Writer`] was dropped before the first list completed.
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        let mut ready = self.ready.clone();
        loop {
            if *ready.borrow_and_update() {
                return Ok(());
            }
            ready.changed().await.map_err(|_| WriterDropped)?;
        }
    }
}

/// Create a (Reader, Writer) for a [`Store`] for a single kind
#[must_use]
pub fn store() -> (Store, Writer) {
    let w = Writer::default();
    let r = w.as_reader();
    (r, w)
}

#[cfg(test)]
mod tests {
    use super::{store, Writer, OWNER_UID_INDEX};
    use crate::{reflector::ObjectRef, watcher};
    use futures::FutureExt;
    use steward_core::{DynamicObject, OwnerReference};

    fn replica(name: &str, rv: &str) -> DynamicObject {
        let mut obj = DynamicObject::new("Replica", name).within("ns");
        obj.metadata.resource_version = Some(rv.into());
        obj
    }

    #[test]
    fn should_allow_getting_namespaced_object_by_namespaced_ref() {
        let obj = replica("obj", "1");
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Apply(obj.clone()));
        let store = store_w.as_reader();
        assert_eq!(store.get(&ObjectRef::from_obj(&obj)).as_deref(), Some(&obj));
    }

    #[test]
    fn should_not_allow_getting_namespaced_object_by_clusterscoped_ref() {
        let obj = replica("obj", "1");
        let mut cluster_obj = obj.clone();
        cluster_obj.metadata.namespace = None;
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Apply(obj));
        let store = store_w.as_reader();
        assert_eq!(store.get(&ObjectRef::from_obj(&cluster_obj)), None);
    }

    #[test]
    fn should_allow_getting_clusterscoped_object_by_namespaced_ref() {
        let mut obj = replica("obj", "1");
        obj.metadata.namespace = None;
        let mut nsed_obj = obj.clone();
        nsed_obj.metadata.namespace = Some("ns".to_string());
        let mut store_w = Writer::default();
        store_w.apply_watcher_event(&watcher::Event::Apply(obj.clone()));
        let store = store_w.as_reader();
        assert_eq!(store.get(&ObjectRef::from_obj(&nsed_obj)).as_deref(), Some(&obj));
    }

    #[test]
    fn relist_swaps_atomically_and_reports_drift() {
        let (reader, mut writer) = store();
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitApply(replica("a", "1")));
        writer.apply_watcher_event(&watcher::Event::InitApply(replica("b", "2")));
        assert!(!reader.is_ready());
        assert!(reader.is_empty(), "listed objects are buffered until InitDone");
        let deltas = writer.apply_watcher_event(&watcher::Event::InitDone);
        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().all(|d| d.old.is_none() && !d.deleted));
        assert!(reader.is_ready());
        assert_eq!(reader.len(), 2);

        // relist: a unchanged, b drifted, c new, and nothing for a deleted object yet
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitApply(replica("a", "1")));
        writer.apply_watcher_event(&watcher::Event::InitApply(replica("c", "5")));
        assert_eq!(reader.len(), 2, "old contents stay readable during a relist");
        let mut deltas = writer.apply_watcher_event(&watcher::Event::InitDone);
        deltas.sort_by_key(|d| d.new.metadata.name.clone());
        let summary = deltas
            .iter()
            .map(|d| (d.new.metadata.name.clone().unwrap(), d.deleted))
            .collect::<Vec<_>>();
        assert_eq!(summary, [("b".to_string(), true), ("c".to_string(), false)]);
        assert_eq!(reader.len(), 2);
        assert!(reader.get(&ObjectRef::new("Replica", "b").within("ns")).is_none());
    }

    #[test]
    fn duplicate_applies_produce_no_delta() {
        let mut writer = Writer::default();
        assert_eq!(writer.apply_watcher_event(&watcher::Event::Apply(replica("a", "1"))).len(), 1);
        assert!(writer.apply_watcher_event(&watcher::Event::Apply(replica("a", "1"))).is_empty());
        let deltas = writer.apply_watcher_event(&watcher::Event::Apply(replica("a", "2")));
        assert_eq!(deltas[0].old.as_ref().and_then(|o| o.metadata.resource_version.clone()).as_deref(), Some("1"));
    }

    #[test]
    fn owner_index_tracks_dependents() {
        let (reader, mut writer) = store();
        let owned = |name: &str, uid: &str| {
            let mut obj = replica(name, "1");
            obj.metadata.owner_references = vec![OwnerReference {
                kind: "Replicated".into(),
                name: "x".into(),
                uid: uid.into(),
                controller: true,
                block_owner_deletion: true,
            }];
            obj
        };
        writer.apply_watcher_event(&watcher::Event::Apply(owned("x-0", "u1")));
        writer.apply_watcher_event(&watcher::Event::Apply(owned("x-1", "u1")));
        assert_eq!(reader.by_index(OWNER_UID_INDEX, "u1").len(), 2);

        // re-owning moves the object between index values
        let mut moved = owned("x-1", "u2");
        moved.metadata.resource_version = Some("2".into());
        writer.apply_watcher_event(&watcher::Event::Apply(moved));
        assert_eq!(reader.by_index(OWNER_UID_INDEX, "u1").len(), 1);
        assert_eq!(reader.by_index(OWNER_UID_INDEX, "u2").len(), 1);

        writer.apply_watcher_event(&watcher::Event::Delete(owned("x-0", "u1")));
        assert!(reader.by_index(OWNER_UID_INDEX, "u1").is_empty());
    }

    #[test]
    fn custom_indexers_are_queryable() {
        let (reader, mut writer) = {
            let writer = Writer::default().with_indexer("app", |obj| {
                obj.metadata.labels.get("app").cloned().into_iter().collect()
            });
            (writer.as_reader(), writer)
        };
        writer.apply_watcher_event(&watcher::Event::Apply(replica("a", "1").label("app", "web")));
        writer.apply_watcher_event(&watcher::Event::Apply(replica("b", "1").label("app", "db")));
        let web = reader.by_index("app", "web");
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].metadata.name.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn readiness_waits_for_first_list() {
        let (reader, mut writer) = store();
        let mut ready = Box::pin(reader.wait_until_ready());
        assert!((&mut ready).now_or_never().is_none());
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitDone);
        assert!(ready.await.is_ok());

        let (reader, writer) = store();
        drop(writer);
        assert!(reader.wait_until_ready().await.is_err());
    }

    #[tokio::test]
    async fn subscribers_receive_deltas() {
        let mut writer = Writer::default();
        let mut rx = writer.subscribe();
        writer.apply_watcher_event(&watcher::Event::Apply(replica("a", "1")));
        writer.apply_watcher_event(&watcher::Event::Delete(replica("a", "1")));
        let first = rx.recv().await.unwrap();
        assert!(!first.deleted);
        let second = rx.recv().await.unwrap();
        assert!(second.deleted);
        drop(writer);
        assert!(rx.recv().await.is_err());
    }
}
