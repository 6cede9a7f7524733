//! Runs a user-supplied reconciler function on objects when they (or related objects) are updated

use self::runner::{ingest, worker, Ingest, Worker};
use crate::{
    coordination::LeaderState,
    error::{Classify, ErrorClass},
    gc::GarbageCollector,
    predicate::Predicate,
    queue::{self, WorkQueue},
    reflector::{ObjectRef, Store, Writer},
    watcher,
};
use futures::{channel::mpsc, Future, Stream, StreamExt};
use std::{sync::Arc, time::Duration};
use steward_client::Client;
use steward_core::{DynamicObject, ResourceExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod runner;

/// Failures surfaced on the [`Controller`] output stream
#[derive(Debug, Error)]
pub enum Error<ReconcilerErr: std::error::Error + 'static> {
    /// The reconciler returned an error
    #[error("reconciler for object {1} failed: {0}")]
    ReconcilerFailed(#[source] ReconcilerErr, ObjectRef),
    /// The reconciler did not finish within the configured deadline
    #[error("reconciler for object {1} timed out after {0:?}")]
    Timeout(Duration, ObjectRef),
}

impl<E: std::error::Error + Classify + 'static> Classify for Error<E> {
    fn class(&self) -> ErrorClass {
        match self {
            Error::ReconcilerFailed(err, _) => err.class(),
            Error::Timeout(..) => ErrorClass::Timeout,
        }
    }
}

/// Results of the reconciliation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until something changes
    Done,
    /// Reconcile again after the duration, unless something changes before
    ///
    /// Use this to poll external systems or to refresh the observed state periodically.
    RequeueAfter(Duration),
    /// Reconcile again right away, typically after a write whose result must be observed first
    RequeueImmediate,
}

impl Action {
    /// Reconcile again after `duration` even if no watch trigger hits
    #[must_use]
    pub fn requeue_after(duration: Duration) -> Self {
        Self::RequeueAfter(duration)
    }
}

/// How a change of a related object turns into work items of the primary kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mapper {
    /// The changed object is itself the work item
    SelfRef,
    /// Every owner reference of the given kind is a work item
    Owners {
        /// Kind of the owners to reconcile
        kind: String,
    },
}

impl Mapper {
    /// The work items triggered by a change of `obj`
    #[must_use]
    pub fn map(&self, obj: &DynamicObject) -> Vec<ObjectRef> {
        match self {
            Mapper::SelfRef => vec![ObjectRef::from_obj(obj)],
            Mapper::Owners { kind } => obj
                .owner_references()
                .iter()
                .filter(|owner| &owner.kind == kind)
                .map(|owner| ObjectRef::from_owner_ref(obj.metadata.namespace.as_deref(), owner))
                .collect(),
        }
    }
}

/// A kind the controller watches, and how its changes trigger reconciliations
#[derive(Clone, Debug)]
pub struct Relation {
    /// The watched kind
    pub kind: String,
    /// Which changes are relevant
    pub predicate: Predicate,
    /// Which primary objects a relevant change triggers
    pub mapper: Mapper,
    /// Scope of the watch
    pub config: watcher::Config,
}

impl Relation {
    /// The primary kind: reconciled on spec, metadata or deletion changes, but not on status writes
    #[must_use]
    pub fn primary(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            predicate: Predicate::Generation
                .or(Predicate::Deletion)
                .or(Predicate::Labels)
                .or(Predicate::Annotations),
            mapper: Mapper::SelfRef,
            config: watcher::Config::default(),
        }
    }

    /// Dependents of `kind` controlled by objects of `owner_kind`, any change triggers the owner
    #[must_use]
    pub fn owned(kind: &str, owner_kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            predicate: Predicate::Always,
            mapper: Mapper::Owners {
                kind: owner_kind.to_string(),
            },
            config: watcher::Config::default(),
        }
    }

    /// Replace the predicate
    #[must_use]
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Replace the watch scope
    #[must_use]
    pub fn with_config(mut self, config: watcher::Config) -> Self {
        self.config = config;
        self
    }
}

/// Tuning of a [`Controller`]
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Slow retry cadence for permanent failures
    pub resync: Duration,
    /// Deadline of a single reconciliation
    pub reconcile_timeout: Duration,
    /// Period of the full garbage collection sweep, `None` disables garbage collection
    pub gc_interval: Option<Duration>,
    /// Backoff of the work queue
    pub queue: queue::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 4,
            resync: Duration::from_secs(300),
            reconcile_timeout: Duration::from_secs(60),
            gc_interval: Some(Duration::from_secs(30)),
            queue: queue::Config::default(),
        }
    }
}

impl Config {
    /// Set the number of workers, at least one runs
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the slow retry cadence
    #[must_use]
    pub fn resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    /// Set the reconciliation deadline
    #[must_use]
    pub fn reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Set or disable the garbage collection sweep
    #[must_use]
    pub fn gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Set the work queue backoff
    #[must_use]
    pub fn queue(mut self, queue: queue::Config) -> Self {
        self.queue = queue;
        self
    }
}

/// The outcome of one reconciliation
#[derive(Debug)]
pub struct ReconcileReport<E: std::error::Error + 'static> {
    /// The reconciled object
    pub obj_ref: ObjectRef,
    /// What the reconciler returned, after the queue acted on it
    pub result: Result<Action, Error<E>>,
}

/// Controller for a primary kind
///
/// A controller watches the primary kind and every related kind, caches them, and runs a
/// reconciler for a primary object whenever a relevant change happens to it or to an object
/// related to it. At most one reconciliation runs per object at any time.
///
/// ```no_run
/// use futures::StreamExt;
/// use std::sync::Arc;
/// use steward_client::MemoryStore;
/// use steward_core::DynamicObject;
/// use steward_runtime::{controller::Action, Controller};
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("never")]
/// struct Never;
/// impl steward_runtime::Classify for Never {
///     fn class(&self) -> steward_runtime::ErrorClass { steward_runtime::ErrorClass::Permanent }
/// }
///
/// async fn reconcile(obj: Arc<DynamicObject>, _ctx: Arc<()>) -> Result<Action, Never> {
///     println!("reconciling {:?}", obj.metadata.name);
///     Ok(Action::Done)
/// }
///
/// # async fn wrapper() {
/// let client = Arc::new(MemoryStore::new());
/// Controller::new(client, "Replicated")
///     .owns("Replica")
///     .run(reconcile, Arc::new(()))
///     .for_each(|report| async move { println!("{:?}", report.result) })
///     .await; // controller does nothing unless polled
/// # }
/// ```
pub struct Controller {
    client: Arc<dyn Client>,
    primary_kind: String,
    relations: Vec<(Relation, Writer)>,
    config: Config,
    leader: Option<watch::Receiver<LeaderState>>,
    shutdown: CancellationToken,
}

impl Controller {
    /// Create a controller reconciling objects of `kind`
    #[must_use]
    pub fn new(client: Arc<dyn Client>, kind: &str) -> Self {
        Self::for_relation(client, Relation::primary(kind))
    }

    /// Create a controller for a customised primary relation
    ///
    /// The mapper of the primary relation is always [`Mapper::SelfRef`].
    #[must_use]
    pub fn for_relation(client: Arc<dyn Client>, mut primary: Relation) -> Self {
        primary.mapper = Mapper::SelfRef;
        Self {
            client,
            primary_kind: primary.kind.clone(),
            relations: vec![(primary, Writer::default())],
            config: Config::default(),
            leader: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Reconcile the owner whenever a dependent of `kind` it controls changes
    #[must_use]
    pub fn owns(self, kind: &str) -> Self {
        let relation = Relation::owned(kind, &self.primary_kind);
        self.watches(relation)
    }

    /// Add a related kind
    ///
    /// A relation for a kind that is already watched replaces the earlier one.
    #[must_use]
    pub fn watches(mut self, relation: Relation) -> Self {
        if relation.kind == self.primary_kind {
            // the cache of the primary kind is the one workers read from
            self.relations[0].0.predicate = self.relations[0].0.predicate.clone().or(relation.predicate);
            return self;
        }
        self.relations.retain(|(existing, _)| existing.kind != relation.kind);
        self.relations.push((relation, Writer::default()));
        self
    }

    /// Replace the tuning
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Only process work while `leader` reports leadership
    ///
    /// Losing leadership stops dequeuing new work while in-flight reconciliations finish.
    #[must_use]
    pub fn leader_election(mut self, leader: watch::Receiver<LeaderState>) -> Self {
        self.leader = Some(leader);
        self
    }

    /// Shut down gracefully once `token` is cancelled
    ///
    /// Watches stop, queued work is dropped, and in-flight reconciliations finish before the
    /// output stream ends.
    #[must_use]
    pub fn shutdown_on(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Retrieve a copy of the cache of `kind` before starting the controller
    #[must_use]
    pub fn store(&self, kind: &str) -> Option<Store> {
        self.relations
            .iter()
            .find(|(relation, _)| relation.kind == kind)
            .map(|(_, writer)| writer.as_reader())
    }

    /// A garbage collector over every cache of this controller
    ///
    /// Reconcilers use it to wait for blocking dependents during cleanup.
    #[must_use]
    pub fn garbage_collector(&self) -> GarbageCollector {
        let gc = self
            .relations
            .iter()
            .fold(GarbageCollector::new(self.client.clone()), |gc, (relation, writer)| {
                gc.with_store(&relation.kind, writer.as_reader())
            });
        match &self.leader {
            Some(leader) => gc.with_leader(leader.clone()),
            None => gc,
        }
    }

    /// Consume all the parameters of the Controller and start the reconciliation stream
    ///
    /// Watches, workers and the garbage collector are spawned when the stream is first polled.
    /// Every finished reconciliation is reported on the stream, which ends after shutdown once
    /// all workers have drained. Dropping the stream stops the controller.
    pub fn run<R, Fut, Ctx, E>(self, reconciler: R, ctx: Arc<Ctx>) -> impl Stream<Item = ReconcileReport<E>> + Send
    where
        R: Fn(Arc<DynamicObject>, Arc<Ctx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Action, E>> + Send + 'static,
        E: std::error::Error + Classify + Send + 'static,
        Ctx: Send + Sync + 'static,
    {
        let reconciler = Arc::new(reconciler);
        async_stream::stream! {
            let token = self.shutdown.child_token();
            // dropping the stream tears down every spawned task
            let _guard = token.clone().drop_guard();
            let queue = WorkQueue::<ObjectRef>::new(self.config.queue.clone());
            let gc = self.garbage_collector();
            let stores = self
                .relations
                .iter()
                .map(|(_, writer)| writer.as_reader())
                .collect::<Vec<_>>();
            let primary = stores[0].clone();
            let (report_tx, mut report_rx) = mpsc::unbounded();

            let gc_tx = self.config.gc_interval.map(|interval| {
                let (tx, rx) = tokio::sync::mpsc::channel(1024);
                tokio::spawn(gc.run(interval, rx, token.clone()));
                tx
            });
            for (relation, writer) in self.relations {
                tokio::spawn(ingest(Ingest {
                    client: self.client.clone(),
                    relation,
                    writer,
                    queue: queue.clone(),
                    gc: gc_tx.clone(),
                    shutdown: token.clone(),
                }));
            }
            drop(gc_tx);
            tokio::spawn({
                let (queue, token) = (queue.clone(), token.clone());
                async move {
                    token.cancelled().await;
                    debug!("shutting down work queue");
                    queue.shut_down();
                }
            });
            info!(kind = %self.primary_kind, workers = self.config.concurrency, "controller started");
            for id in 0..self.config.concurrency.max(1) {
                tokio::spawn(worker(Worker {
                    id,
                    queue: queue.clone(),
                    primary: primary.clone(),
                    stores: stores.clone(),
                    reconciler: reconciler.clone(),
                    ctx: ctx.clone(),
                    config: self.config.clone(),
                    leader: self.leader.clone(),
                    reports: report_tx.clone(),
                    shutdown: token.clone(),
                }));
            }
            drop(report_tx);
            while let Some(report) = report_rx.next().await {
                yield report;
            }
            info!(kind = %self.primary_kind, "controller stopped");
        }
    }
}
