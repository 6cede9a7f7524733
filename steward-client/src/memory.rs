//! An in-process resource store
//!
//! [`MemoryStore`] implements [`Client`] with the semantics controllers rely on:
//! optimistic concurrency on `resource_version`, store-owned `generation`, finalizer-gated
//! deletion, a bounded watch history that answers stale resumes with `410 Expired`, and
//! leases. Faults can be injected per [`Verb`] to exercise retry paths.
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use steward_core::{DynamicObject, ErrorResponse, ListParams, ObjectList, ResourceExt, WatchEvent};
use tokio::{sync::broadcast, time::Instant};
use tracing::{debug, trace};

use crate::{
    client::{Client, DeleteOutcome, WatchStream},
    lease::Lease,
    Error, Result,
};

const DEFAULT_HISTORY_LIMIT: usize = 1000;
const WATCH_BUFFER: usize = 1024;

/// Store operations that faults can be injected into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    /// [`Client::list`]
    List,
    /// [`Client::watch`]
    Watch,
    /// [`Client::get`]
    Get,
    /// [`Client::create`]
    Create,
    /// [`Client::replace`]
    Replace,
    /// [`Client::replace_status`]
    ReplaceStatus,
    /// [`Client::delete`]
    Delete,
    /// Every lease operation
    Lease,
}

type Key = (String, Option<String>, String);

fn key_of(kind: &str, namespace: Option<&str>, name: &str) -> Key {
    (kind.to_string(), namespace.map(String::from), name.to_string())
}

#[derive(Clone, Debug)]
struct Recorded {
    kind: String,
    revision: u64,
    event: WatchEvent,
}

impl Recorded {
    fn object(&self) -> Option<&DynamicObject> {
        match &self.event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => Some(obj),
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
        }
    }

    fn matches(&self, kind: &str, lp: &ListParams) -> bool {
        self.kind == kind && self.object().is_some_and(|obj| lp.matches(&obj.metadata))
    }
}

#[derive(Clone, Debug)]
enum Signal {
    Event(Arc<Recorded>),
    Disconnect,
}

struct State {
    revision: u64,
    objects: BTreeMap<Key, DynamicObject>,
    history: VecDeque<Arc<Recorded>>,
    history_limit: usize,
    /// Oldest version a watch can still resume from
    floor: u64,
    faults: HashMap<Verb, VecDeque<ErrorResponse>>,
    leases: BTreeMap<String, Lease>,
}

impl State {
    fn fault(&mut self, verb: Verb) -> Result<()> {
        match self.faults.get_mut(&verb).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(?verb, code = err.code, "injected store fault");
                Err(Error::Api(err))
            }
            None => Ok(()),
        }
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn record(&mut self, tx: &broadcast::Sender<Signal>, kind: &str, event: WatchEvent) {
        let recorded = Arc::new(Recorded {
            kind: kind.to_string(),
            revision: self.revision,
            event,
        });
        self.history.push_back(recorded.clone());
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.floor = dropped.revision;
            }
        }
        // no receivers is fine
        let _ = tx.send(Signal::Event(recorded));
    }
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<Signal>,
}

/// An in-memory [`Client`]
///
/// Cloning is cheap and every clone shares the same objects, history and leases.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty store
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    revision: 0,
                    objects: BTreeMap::new(),
                    history: VecDeque::new(),
                    history_limit: DEFAULT_HISTORY_LIMIT,
                    floor: 0,
                    faults: HashMap::new(),
                    leases: BTreeMap::new(),
                }),
                events,
            }),
        }
    }

    /// Retain at most `limit` events for resuming watches
    #[must_use]
    pub fn with_history_limit(self, limit: usize) -> Self {
        self.inner.state.lock().history_limit = limit.max(1);
        self
    }

    /// Fail the next call of `verb` with `err`
    ///
    /// Faults queue up, so injecting twice fails the next two calls.
    pub fn inject_error(&self, verb: Verb, err: ErrorResponse) {
        self.inner.state.lock().faults.entry(verb).or_default().push_back(err);
    }

    /// Drop any faults that have not fired yet
    pub fn clear_errors(&self) {
        self.inner.state.lock().faults.clear();
    }

    /// End every open watch stream, as a dropped connection would
    pub fn disconnect_watches(&self) {
        let _ = self.inner.events.send(Signal::Disconnect);
    }

    /// Forget all history, so resuming any watch from before now yields `410 Expired`
    pub fn compact(&self) {
        let mut state = self.inner.state.lock();
        state.history.clear();
        state.floor = state.revision;
    }

    /// The current store revision, bumped by every persisted change
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.inner.state.lock().revision
    }

    /// Number of objects currently stored across all kinds
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().objects.len()
    }

    /// Whether the store holds no objects
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(obj: &DynamicObject) -> Result<()> {
        let controllers = obj.owner_references().iter().filter(|o| o.controller).count();
        if controllers > 1 {
            return Err(Error::Api(ErrorResponse::invalid(
                obj.types.kind.as_str(),
                &obj.name_any(),
                "only one owner reference may be a controller",
            )));
        }
        Ok(())
    }

    fn key(obj: &DynamicObject) -> Result<Key> {
        let name = obj.metadata.name.as_deref().ok_or_else(|| {
            Error::Api(ErrorResponse::invalid(obj.types.kind.as_str(), "", "name is required"))
        })?;
        Ok(key_of(&obj.types.kind, obj.metadata.namespace.as_deref(), name))
    }

    fn check_version(current: &DynamicObject, incoming: &DynamicObject) -> Result<()> {
        match &incoming.metadata.resource_version {
            Some(rv) if Some(rv) != current.metadata.resource_version.as_ref() => Err(Error::Api(
                ErrorResponse::conflict(current.types.kind.as_str(), &current.name_any()),
            )),
            _ => Ok(()),
        }
    }

    fn watch_stream(&self, kind: &str, lp: &ListParams, version: &str) -> Result<WatchStream> {
        let from: u64 = version.parse().map_err(|_| {
            Error::Api(ErrorResponse::invalid(kind, "", &format!("bad resource version {version:?}")))
        })?;
        let mut state = self.inner.state.lock();
        state.fault(Verb::Watch)?;
        if from < state.floor {
            debug!(kind, from, floor = state.floor, "watch resume version expired");
            let expired = WatchEvent::Error(ErrorResponse::expired(version));
            return Ok(futures::stream::iter([Ok(expired)]).boxed());
        }
        let replay: Vec<WatchEvent> = state
            .history
            .iter()
            .filter(|rec| rec.revision > from && rec.matches(kind, lp))
            .map(|rec| rec.event.clone())
            .collect();
        let seen = state.revision;
        // subscribe while locked so no event falls between replay and live
        let mut rx = self.inner.events.subscribe();
        drop(state);

        let (kind, lp) = (kind.to_string(), lp.clone());
        let stream = async_stream::stream! {
            for event in replay {
                yield Ok(event);
            }
            loop {
                match rx.recv().await {
                    Ok(Signal::Event(rec)) => {
                        if rec.revision > seen && rec.matches(&kind, &lp) {
                            yield Ok(rec.event.clone());
                        }
                    }
                    Ok(Signal::Disconnect) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(kind = %kind, skipped, "watch fell behind");
                        yield Ok(WatchEvent::Error(ErrorResponse::expired(&seen.to_string())));
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[async_trait]
impl Client for MemoryStore {
    async fn list(&self, kind: &str, lp: &ListParams) -> Result<ObjectList> {
        let mut state = self.inner.state.lock();
        state.fault(Verb::List)?;
        let items = state
            .objects
            .iter()
            .filter(|((k, _, _), obj)| k == kind && lp.matches(&obj.metadata))
            .map(|(_, obj)| obj.clone())
            .collect();
        Ok(ObjectList {
            items,
            resource_version: state.revision.to_string(),
        })
    }

    async fn watch(&self, kind: &str, lp: &ListParams, version: &str) -> Result<WatchStream> {
        self.watch_stream(kind, lp, version)
    }

    async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        let mut state = self.inner.state.lock();
        state.fault(Verb::Get)?;
        state
            .objects
            .get(&key_of(kind, namespace, name))
            .cloned()
            .ok_or_else(|| Error::Api(ErrorResponse::not_found(kind, name)))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = Self::key(obj)?;
        Self::validate(obj)?;
        let mut state = self.inner.state.lock();
        state.fault(Verb::Create)?;
        if state.objects.contains_key(&key) {
            return Err(Error::Api(ErrorResponse::already_exists(&key.0, &key.2)));
        }
        let revision = state.next_revision();
        let mut created = obj.clone();
        created.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        created.metadata.generation = Some(1);
        created.metadata.resource_version = Some(revision.to_string());
        created.metadata.creation_timestamp = Some(Utc::now());
        created.metadata.deletion_timestamp = None;
        // status is only written through replace_status
        created.status = None;
        debug!(kind = %key.0, name = %key.2, revision, "created");
        state.objects.insert(key.clone(), created.clone());
        state.record(&self.inner.events, &key.0, WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = Self::key(obj)?;
        Self::validate(obj)?;
        let mut state = self.inner.state.lock();
        state.fault(Verb::Replace)?;
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::Api(ErrorResponse::not_found(&key.0, &key.2)))?;
        Self::check_version(&current, obj)?;
        if current.is_terminating()
            && obj.finalizers().iter().any(|f| !current.finalizers().contains(f))
        {
            return Err(Error::Api(ErrorResponse::invalid(
                &key.0,
                &key.2,
                "no new finalizers can be added if the object is being deleted",
            )));
        }

        let mut next = current.clone();
        next.metadata.labels = obj.metadata.labels.clone();
        next.metadata.annotations = obj.metadata.annotations.clone();
        next.metadata.owner_references = obj.metadata.owner_references.clone();
        next.metadata.finalizers = obj.metadata.finalizers.clone();
        next.spec = obj.spec.clone();
        if next == current {
            trace!(kind = %key.0, name = %key.2, "replace is a no-op");
            return Ok(next);
        }
        if next.spec != current.spec {
            next.metadata.generation = Some(current.generation() + 1);
        }
        let revision = state.next_revision();
        next.metadata.resource_version = Some(revision.to_string());

        if next.is_terminating() && next.finalizers().is_empty() {
            debug!(kind = %key.0, name = %key.2, revision, "last finalizer removed, purging");
            state.objects.remove(&key);
            state.record(&self.inner.events, &key.0, WatchEvent::Deleted(next.clone()));
        } else {
            debug!(kind = %key.0, name = %key.2, revision, "replaced");
            state.objects.insert(key.clone(), next.clone());
            state.record(&self.inner.events, &key.0, WatchEvent::Modified(next.clone()));
        }
        Ok(next)
    }

    async fn replace_status(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = Self::key(obj)?;
        let mut state = self.inner.state.lock();
        state.fault(Verb::ReplaceStatus)?;
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::Api(ErrorResponse::not_found(&key.0, &key.2)))?;
        Self::check_version(&current, obj)?;
        if current.status == obj.status {
            trace!(kind = %key.0, name = %key.2, "status replace is a no-op");
            return Ok(current);
        }
        let mut next = current;
        next.status = obj.status.clone();
        let revision = state.next_revision();
        next.metadata.resource_version = Some(revision.to_string());
        debug!(kind = %key.0, name = %key.2, revision, "status replaced");
        state.objects.insert(key.clone(), next.clone());
        state.record(&self.inner.events, &key.0, WatchEvent::Modified(next.clone()));
        Ok(next)
    }

    async fn delete(&self, kind: &str, namespace: Option<&str>, name: &str) -> Result<DeleteOutcome> {
        let key = key_of(kind, namespace, name);
        let mut state = self.inner.state.lock();
        state.fault(Verb::Delete)?;
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::Api(ErrorResponse::not_found(kind, name)))?;
        if current.is_terminating() {
            return Ok(DeleteOutcome::Terminating(current));
        }
        let mut next = current;
        let revision = state.next_revision();
        next.metadata.resource_version = Some(revision.to_string());
        if next.finalizers().is_empty() {
            debug!(kind, name, revision, "deleted");
            state.objects.remove(&key);
            state.record(&self.inner.events, kind, WatchEvent::Deleted(next.clone()));
            Ok(DeleteOutcome::Purged(next))
        } else {
            debug!(kind, name, revision, finalizers = ?next.finalizers(), "deletion requested");
            next.metadata.deletion_timestamp = Some(Utc::now());
            state.objects.insert(key, next.clone());
            state.record(&self.inner.events, kind, WatchEvent::Modified(next.clone()));
            Ok(DeleteOutcome::Terminating(next))
        }
    }

    async fn acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.inner.state.lock();
        state.fault(Verb::Lease)?;
        let now = Instant::now();
        let lease = state.leases.entry(name.to_string()).or_insert_with(|| Lease {
            name: name.to_string(),
            holder_identity: None,
            lease_duration: ttl,
            renew_time: now,
            lease_transitions: 0,
        });
        let free = lease.holder_identity.is_none() || lease.is_expired(now);
        if !free && lease.holder_identity.as_deref() != Some(holder) {
            return Ok(false);
        }
        if lease.holder_identity.as_deref().is_some_and(|current| current != holder) {
            lease.lease_transitions += 1;
        }
        lease.holder_identity = Some(holder.to_string());
        lease.renew_time = now;
        lease.lease_duration = ttl;
        Ok(true)
    }

    async fn renew_lease(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.inner.state.lock();
        state.fault(Verb::Lease)?;
        match state.leases.get_mut(name) {
            Some(lease) if lease.holder_identity.as_deref() == Some(holder) => {
                lease.renew_time = Instant::now();
                lease.lease_duration = ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<bool> {
        let mut state = self.inner.state.lock();
        state.fault(Verb::Lease)?;
        match state.leases.get_mut(name) {
            Some(lease) if lease.holder_identity.as_deref() == Some(holder) => {
                lease.holder_identity = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_lease(&self, name: &str) -> Result<Option<Lease>> {
        let mut state = self.inner.state.lock();
        state.fault(Verb::Lease)?;
        Ok(state.leases.get(name).cloned())
    }
}
