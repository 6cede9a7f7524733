//! Owner reference garbage collection
//!
//! A dependent is collected once nothing that owns it is left to keep it alive. Ownership is
//! judged from the reflector caches only, so the collector never deletes anything until every
//! cache it consults has completed its first list.
use crate::{
    coordination::LeaderState,
    reflector::{ObjectRef, Store, OWNER_UID_INDEX},
};
use ahash::AHashMap;
use std::{sync::Arc, time::Duration};
use steward_client::{Client, DeleteOutcome, Error as ClientError};
use steward_core::{DynamicObject, OwnerReference, Resource, ResourceExt};
use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How an owner reference resolves against the caches
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnerStatus {
    /// The owner exists with the referenced uid, or cannot be judged
    Live,
    /// The owner exists but has been asked to go away
    Terminating,
    /// Nothing with that name and uid exists
    Absent,
}

/// Deletes dependents whose owners are gone
///
/// Cloning produces a collector over the same caches.
#[derive(Clone)]
pub struct GarbageCollector {
    client: Arc<dyn Client>,
    stores: AHashMap<String, Store>,
    leader: Option<watch::Receiver<LeaderState>>,
}

impl GarbageCollector {
    /// A collector without any caches, which never collects anything
    #[must_use]
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            stores: AHashMap::new(),
            leader: None,
        }
    }

    /// Consult and sweep the cache of `kind`
    #[must_use]
    pub fn with_store(mut self, kind: &str, store: Store) -> Self {
        self.stores.insert(kind.to_string(), store);
        self
    }

    /// Only delete while `leader` reports leadership
    #[must_use]
    pub fn with_leader(mut self, leader: watch::Receiver<LeaderState>) -> Self {
        self.leader = Some(leader);
        self
    }

    fn is_leading(&self) -> bool {
        self.leader.as_ref().is_none_or(|rx| rx.borrow().is_leader())
    }

    /// Resolve `owner` as referenced from a dependent in `namespace`
    ///
    /// Owners of kinds without a cache, or whose cache has not been filled yet, count as live.
    #[must_use]
    pub fn owner_status(&self, namespace: Option<&str>, owner: &OwnerReference) -> OwnerStatus {
        let Some(store) = self.stores.get(&owner.kind) else {
            return OwnerStatus::Live;
        };
        if !store.is_ready() {
            return OwnerStatus::Live;
        }
        match store.get(&ObjectRef::from_owner_ref(namespace, owner)) {
            // a different uid is a newer object reusing the name
            Some(obj) if obj.uid().as_deref() == Some(owner.uid.as_str()) => {
                if obj.is_terminating() {
                    OwnerStatus::Terminating
                } else {
                    OwnerStatus::Live
                }
            }
            _ => OwnerStatus::Absent,
        }
    }

    /// Whether `dependent` may be deleted
    ///
    /// Objects without owner references are never orphans. With a controlling owner, the
    /// dependent is released once that owner is absent or terminating and every other owner
    /// that blocks deletion is absent. Without one, every owner has to be absent.
    #[must_use]
    pub fn is_orphan(&self, dependent: &DynamicObject) -> bool {
        let namespace = dependent.metadata.namespace.as_deref();
        orphaned(dependent, |owner| self.owner_status(namespace, owner))
    }

    /// Resolve `owner` against the store itself rather than the caches
    async fn live_owner_status(
        &self,
        namespace: Option<&str>,
        owner: &OwnerReference,
    ) -> Result<OwnerStatus, ClientError> {
        let current = self.client.get_opt(&owner.kind, namespace, &owner.name).await?;
        Ok(match current {
            Some(obj) if obj.uid().as_deref() == Some(owner.uid.as_str()) => {
                if obj.is_terminating() {
                    OwnerStatus::Terminating
                } else {
                    OwnerStatus::Live
                }
            }
            _ => OwnerStatus::Absent,
        })
    }

    /// Re-judge a cached orphan with fresh reads of its owners
    ///
    /// Owner and dependent caches fill independently, so a dependent can be cached before the
    /// owner that was created ahead of it.
    async fn confirm_orphan(&self, dependent: &DynamicObject) -> Result<bool, ClientError> {
        let namespace = dependent.metadata.namespace.as_deref();
        let mut live = AHashMap::new();
        for owner in dependent.owner_references() {
            live.insert(owner.uid.clone(), self.live_owner_status(namespace, owner).await?);
        }
        Ok(orphaned(dependent, |owner| {
            live.get(&owner.uid).copied().unwrap_or(OwnerStatus::Live)
        }))
    }

    /// Delete `dependent` if it is an orphan, returning whether a deletion was requested
    ///
    /// Dependents that are already terminating are left to their own finalizers.
    ///
    /// # Errors
    ///
    /// Passes store failures through, except NotFound which means someone else was faster.
    pub async fn check(&self, dependent: &DynamicObject) -> Result<bool, ClientError> {
        if dependent.is_terminating() || !self.is_orphan(dependent) {
            return Ok(false);
        }
        let name = dependent.name_any();
        if !self.confirm_orphan(dependent).await? {
            debug!(kind = dependent.kind(), name = %name, "owner is alive in the store, cache is behind");
            return Ok(false);
        }
        match self
            .client
            .delete(dependent.kind(), dependent.metadata.namespace.as_deref(), &name)
            .await
        {
            Ok(outcome) => {
                let purged = matches!(outcome, DeleteOutcome::Purged(_));
                info!(kind = dependent.kind(), name = %name, purged, "collected orphaned dependent");
                Ok(true)
            }
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Check every cached dependent of `owner`
    ///
    /// # Errors
    ///
    /// Returns the last store failure, after attempting every dependent.
    pub async fn check_related(&self, owner: &DynamicObject) -> Result<usize, ClientError> {
        let Some(uid) = owner.uid() else { return Ok(0) };
        let dependents = self
            .stores
            .values()
            .flat_map(|store| store.by_index(OWNER_UID_INDEX, &uid))
            .collect::<Vec<_>>();
        self.check_all(dependents).await
    }

    /// Check every object in every cache, returning how many deletions were requested
    ///
    /// # Errors
    ///
    /// Returns the last store failure, after attempting every object.
    pub async fn sweep(&self) -> Result<usize, ClientError> {
        let candidates = self
            .stores
            .values()
            .flat_map(Store::state)
            .filter(|obj| !obj.owner_references().is_empty())
            .collect::<Vec<_>>();
        self.check_all(candidates).await
    }

    async fn check_all(&self, dependents: Vec<Arc<DynamicObject>>) -> Result<usize, ClientError> {
        let mut collected = 0;
        let mut last_err = None;
        for dependent in dependents {
            match self.check(&dependent).await {
                Ok(true) => collected += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(error = %err, object = %ObjectRef::from_obj(&*dependent), "failed to collect dependent");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(collected),
        }
    }

    /// Dependents of `owner` that still block its deletion
    ///
    /// Includes dependents that are terminating but held by their own finalizers. Owners can
    /// keep their cleanup failing while this is non-empty to delete only after their dependents.
    #[must_use]
    pub fn blocking_dependents(&self, owner: &DynamicObject) -> Vec<Arc<DynamicObject>> {
        let Some(uid) = owner.uid() else { return Vec::new() };
        self.stores
            .values()
            .flat_map(|store| store.by_index(OWNER_UID_INDEX, &uid))
            .filter(|dependent| {
                dependent
                    .owner_references()
                    .iter()
                    .any(|o| o.uid == uid && o.block_owner_deletion)
            })
            .collect()
    }

    /// Inspect a changed object: collect it if orphaned, and its dependents if it is going away
    async fn inspect(&self, obj: &DynamicObject) {
        let own_ref = ObjectRef::from_obj(obj);
        let cached = self.stores.get(obj.kind()).and_then(|store| store.get(&own_ref));
        if let Some(current) = &cached {
            if let Err(err) = self.check(current).await {
                warn!(error = %err, object = %own_ref, "failed to collect dependent");
            }
        }
        let gone = cached.as_ref().is_none_or(|current| current.is_terminating());
        if gone {
            if let Err(err) = self.check_related(obj).await {
                warn!(error = %err, owner = %own_ref, "failed to collect dependents");
            }
        }
    }

    /// Collect continuously until `shutdown` fires
    ///
    /// Objects received on `candidates` are inspected right away, and a full [`sweep`](Self::sweep)
    /// runs every `interval`. Nothing is deleted while this collector is not leading.
    pub async fn run(
        self,
        interval: Duration,
        mut candidates: mpsc::Receiver<Arc<DynamicObject>>,
        shutdown: CancellationToken,
    ) {
        for (kind, store) in &self.stores {
            tokio::select! {
                ready = store.wait_until_ready() => if ready.is_err() {
                    warn!(kind, "cache writer went away before the first list");
                },
                () = shutdown.cancelled() => return,
            }
        }
        debug!(kinds = self.stores.len(), "garbage collector started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut candidates_open = true;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.is_leading() {
                        match self.sweep().await {
                            Ok(collected) => debug!(collected, "sweep complete"),
                            Err(err) => warn!(error = %err, "sweep incomplete"),
                        }
                    }
                }
                candidate = candidates.recv(), if candidates_open => match candidate {
                    Some(obj) if self.is_leading() => self.inspect(&obj).await,
                    Some(_) => {}
                    // only the periodic sweep is left
                    None => candidates_open = false,
                },
            }
        }
        debug!("garbage collector stopped");
    }
}

/// The collection rule, given how each owner reference resolves
fn orphaned(dependent: &DynamicObject, status: impl Fn(&OwnerReference) -> OwnerStatus) -> bool {
    let owners = dependent.owner_references();
    if owners.is_empty() {
        return false;
    }
    match dependent.controller_ref() {
        Some(controller) => {
            status(controller) != OwnerStatus::Live
                && owners
                    .iter()
                    .filter(|owner| !owner.controller && owner.block_owner_deletion)
                    .all(|owner| status(owner) == OwnerStatus::Absent)
        }
        None => owners.iter().all(|owner| status(owner) == OwnerStatus::Absent),
    }
}

#[cfg(test)]
mod tests {
    use super::{GarbageCollector, OwnerStatus};
    use crate::{
        reflector::{store, Store, Writer},
        watcher,
    };
    use std::sync::Arc;
    use steward_client::{Client, MemoryStore};
    use steward_core::{DynamicObject, OwnerReference, Resource};

    struct Fixture {
        client: MemoryStore,
        owners: (Store, Writer),
        dependents: (Store, Writer),
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                client: MemoryStore::new(),
                owners: store(),
                dependents: store(),
            }
        }

        fn gc(&self) -> GarbageCollector {
            GarbageCollector::new(Arc::new(self.client.clone()))
                .with_store("Replicated", self.owners.0.clone())
                .with_store("Replica", self.dependents.0.clone())
        }

        async fn sync(&mut self) {
            for (kind, writer) in [("Replicated", &mut self.owners.1), ("Replica", &mut self.dependents.1)] {
                let list = self.client.list(kind, &Default::default()).await.unwrap();
                writer.apply_watcher_event(&watcher::Event::Init);
                for obj in list.items {
                    writer.apply_watcher_event(&watcher::Event::InitApply(obj));
                }
                writer.apply_watcher_event(&watcher::Event::InitDone);
            }
        }

        async fn owner(&self, name: &str) -> DynamicObject {
            self.client
                .create(&DynamicObject::new("Replicated", name).within("ns"))
                .await
                .unwrap()
        }

        async fn dependent(&self, name: &str, owners: Vec<OwnerReference>) -> DynamicObject {
            let mut obj = DynamicObject::new("Replica", name).within("ns");
            obj.metadata.owner_references = owners;
            self.client.create(&obj).await.unwrap()
        }
    }

    fn blocking(owner: &DynamicObject) -> OwnerReference {
        OwnerReference {
            controller: false,
            ..owner.controller_owner_ref().unwrap()
        }
    }

    #[tokio::test]
    async fn objects_without_owners_are_never_collected() {
        let mut fx = Fixture::new();
        fx.dependent("free", vec![]).await;
        fx.sync().await;
        assert_eq!(fx.gc().sweep().await.unwrap(), 0);
        assert_eq!(fx.client.len(), 1);
    }

    #[tokio::test]
    async fn nothing_is_collected_before_caches_are_ready() {
        let fx = Fixture::new();
        let x = fx.owner("x").await;
        let dep = fx.dependent("x-0", vec![x.controller_owner_ref().unwrap()]).await;
        // caches never listed: the owner looks absent only once its cache is ready
        assert_eq!(
            fx.gc().owner_status(Some("ns"), &x.controller_owner_ref().unwrap()),
            OwnerStatus::Live
        );
        assert!(!fx.gc().is_orphan(&dep));
    }

    #[tokio::test]
    async fn owners_missing_from_a_stale_cache_are_confirmed_in_the_store() {
        let mut fx = Fixture::new();
        fx.sync().await;
        let x = fx.owner("x").await;
        let dep = fx.dependent("x-0", vec![x.controller_owner_ref().unwrap()]).await;
        let gc = fx.gc();
        assert!(gc.is_orphan(&dep), "the cache has not seen x yet");
        assert!(!gc.check(&dep).await.unwrap());
        assert!(fx.client.get_opt("Replica", Some("ns"), "x-0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dependents_of_live_owners_stay() {
        let mut fx = Fixture::new();
        let x = fx.owner("x").await;
        fx.dependent("x-0", vec![x.controller_owner_ref().unwrap()]).await;
        fx.sync().await;
        assert_eq!(fx.gc().sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dependents_of_deleted_or_replaced_owners_go() {
        let mut fx = Fixture::new();
        let x = fx.owner("x").await;
        fx.dependent("x-0", vec![x.controller_owner_ref().unwrap()]).await;
        fx.client.delete("Replicated", Some("ns"), "x").await.unwrap();
        // a new owner under the same name does not adopt the old dependents
        fx.owner("x").await;
        fx.sync().await;
        let gc = fx.gc();
        assert_eq!(gc.sweep().await.unwrap(), 1);
        assert!(fx.client.get_opt("Replica", Some("ns"), "x-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminating_controller_releases_dependents() {
        let mut fx = Fixture::new();
        let mut x = DynamicObject::new("Replicated", "x").within("ns");
        x.metadata.finalizers.push("core/cleanup".into());
        let x = fx.client.create(&x).await.unwrap();
        fx.dependent("x-0", vec![x.controller_owner_ref().unwrap()]).await;
        fx.client.delete("Replicated", Some("ns"), "x").await.unwrap();
        fx.sync().await;
        let gc = fx.gc();
        let terminating = gc.owners_view("x");
        assert_eq!(gc.blocking_dependents(&terminating).len(), 1);
        assert_eq!(gc.check_related(&terminating).await.unwrap(), 1);
        fx.sync().await;
        assert!(gc.blocking_dependents(&terminating).is_empty());
    }

    #[tokio::test]
    async fn blocking_owners_must_be_gone_too() {
        let mut fx = Fixture::new();
        let x = fx.owner("x").await;
        let audit = fx.owner("audit").await;
        fx.dependent("x-0", vec![x.controller_owner_ref().unwrap(), blocking(&audit)])
            .await;
        fx.client.delete("Replicated", Some("ns"), "x").await.unwrap();
        fx.sync().await;
        assert_eq!(fx.gc().sweep().await.unwrap(), 0, "audit still blocks");

        fx.client.delete("Replicated", Some("ns"), "audit").await.unwrap();
        fx.sync().await;
        assert_eq!(fx.gc().sweep().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn without_controller_every_owner_must_be_absent() {
        let mut fx = Fixture::new();
        let a = fx.owner("a").await;
        let b = fx.owner("b").await;
        fx.dependent("shared", vec![blocking(&a), blocking(&b)]).await;
        fx.client.delete("Replicated", Some("ns"), "a").await.unwrap();
        fx.sync().await;
        assert_eq!(fx.gc().sweep().await.unwrap(), 0);
        fx.client.delete("Replicated", Some("ns"), "b").await.unwrap();
        fx.sync().await;
        assert_eq!(fx.gc().sweep().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_owner_kinds_count_as_live() {
        let mut fx = Fixture::new();
        let foreign = OwnerReference {
            kind: "Deployment".into(),
            name: "d".into(),
            uid: "d-uid".into(),
            controller: true,
            block_owner_deletion: true,
        };
        fx.dependent("x-0", vec![foreign]).await;
        fx.sync().await;
        assert_eq!(fx.gc().sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn finalizers_on_dependents_are_honoured() {
        let mut fx = Fixture::new();
        let x = fx.owner("x").await;
        let mut dep = DynamicObject::new("Replica", "x-0").within("ns");
        dep.metadata.owner_references = vec![x.controller_owner_ref().unwrap()];
        dep.metadata.finalizers = vec!["replica/drain".into()];
        fx.client.create(&dep).await.unwrap();
        fx.client.delete("Replicated", Some("ns"), "x").await.unwrap();
        fx.sync().await;
        assert_eq!(fx.gc().sweep().await.unwrap(), 1);
        fx.sync().await;
        // terminating, held by its finalizer, and not deleted twice
        let stored = fx.client.get("Replica", Some("ns"), "x-0").await.unwrap();
        assert!(stored.metadata.deletion_timestamp.is_some());
        assert_eq!(fx.gc().sweep().await.unwrap(), 0);
    }

    impl GarbageCollector {
        fn owners_view(&self, name: &str) -> DynamicObject {
            let store = &self.stores["Replicated"];
            let key = crate::reflector::ObjectRef::new("Replicated", name).within("ns");
            (*store.get(&key).unwrap()).clone()
        }
    }
}
