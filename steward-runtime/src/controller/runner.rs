use super::{Action, Config, Error, ReconcileReport, Relation};
use crate::{
    coordination::LeaderState,
    error::{Classify, ErrorClass},
    queue::WorkQueue,
    reflector::{ObjectRef, Store, Writer},
    utils::{until_leadership, while_leading, WatchStreamExt},
    watcher,
};
use futures::{channel::mpsc::UnboundedSender, Future, StreamExt};
use std::sync::Arc;
use steward_client::Client;
use steward_core::{DynamicObject, ResourceExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

pub(super) struct Ingest {
    pub(super) client: Arc<dyn Client>,
    pub(super) relation: Relation,
    pub(super) writer: Writer,
    pub(super) queue: WorkQueue<ObjectRef>,
    pub(super) gc: Option<mpsc::Sender<Arc<DynamicObject>>>,
    pub(super) shutdown: CancellationToken,
}

/// Feed one watched kind into its cache, and relevant changes into the work queue
pub(super) async fn ingest(mut ingest: Ingest) {
    let kind = ingest.relation.kind.clone();
    let events = watcher::watcher(ingest.client.clone(), &kind, ingest.relation.config.clone())
        .default_backoff();
    futures::pin_mut!(events);
    loop {
        let event = tokio::select! {
            () = ingest.shutdown.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => ingest.apply(&event),
            Some(Err(err)) => warn!(%kind, error = %err, "watch failed, backing off"),
            None => break,
        }
    }
    debug!(%kind, "ingest stopped");
}

impl Ingest {
    fn apply(&mut self, event: &watcher::Event) {
        for delta in self.writer.apply_watcher_event(event) {
            if let Some(gc) = &self.gc {
                let obj = &delta.new;
                if delta.deleted || obj.is_terminating() || !obj.owner_references().is_empty() {
                    // a full queue only delays collection until the next sweep
                    let _ = gc.try_send(obj.clone());
                }
            }
            if !self.relation.predicate.accept(&delta.change()) {
                continue;
            }
            for key in self.relation.mapper.map(&delta.new) {
                trace!(object.ref = %key, "queueing");
                self.queue.add(key);
            }
        }
    }
}

pub(super) struct Worker<R, Ctx, E: std::error::Error + 'static> {
    pub(super) id: usize,
    pub(super) queue: WorkQueue<ObjectRef>,
    pub(super) primary: Store,
    pub(super) stores: Vec<Store>,
    pub(super) reconciler: Arc<R>,
    pub(super) ctx: Arc<Ctx>,
    pub(super) config: Config,
    pub(super) leader: Option<watch::Receiver<LeaderState>>,
    pub(super) reports: UnboundedSender<ReconcileReport<E>>,
    pub(super) shutdown: CancellationToken,
}

/// Drain the work queue until it shuts down
///
/// Nothing is dequeued before every cache has completed its first list, nor while leadership
/// is lost.
pub(super) async fn worker<R, Fut, Ctx, E>(mut worker: Worker<R, Ctx, E>)
where
    R: Fn(Arc<DynamicObject>, Arc<Ctx>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, E>> + Send + 'static,
    E: std::error::Error + Classify + Send + 'static,
    Ctx: Send + Sync + 'static,
{
    for store in &worker.stores {
        tokio::select! {
            ready = store.wait_until_ready() => if ready.is_err() { return },
            () = worker.shutdown.cancelled() => return,
        }
    }
    loop {
        // give the ingest tasks a chance to cache our own writes before the next pass
        tokio::task::yield_now().await;
        if let Some(leader) = worker.leader.as_mut() {
            tokio::select! {
                () = until_leadership(leader, true) => {},
                () = worker.shutdown.cancelled() => break,
            }
        }
        let Some(next) = while_leading(worker.leader.as_mut(), worker.queue.get()).await else {
            debug!(worker = worker.id, "leadership lost, pausing");
            continue;
        };
        let Some(obj_ref) = next else {
            break;
        };
        let span = info_span!("reconciling object", object.ref = %obj_ref, worker = worker.id);
        let result = worker.reconcile(&obj_ref).instrument(span.clone()).await;
        span.in_scope(|| schedule(&worker.queue, &obj_ref, &result, &worker.config));
        worker.queue.done(&obj_ref);
        if worker
            .reports
            .unbounded_send(ReconcileReport { obj_ref, result })
            .is_err()
        {
            break;
        }
    }
    debug!(worker = worker.id, "worker stopped");
}

impl<R, Fut, Ctx, E> Worker<R, Ctx, E>
where
    R: Fn(Arc<DynamicObject>, Arc<Ctx>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, E>> + Send + 'static,
    E: std::error::Error + Classify + Send + 'static,
{
    async fn reconcile(&self, obj_ref: &ObjectRef) -> Result<Action, Error<E>> {
        let Some(obj) = self.primary.get(obj_ref) else {
            // deleted and purged since it was queued
            debug!("object is gone");
            return Ok(Action::Done);
        };
        let timeout = self.config.reconcile_timeout;
        match tokio::time::timeout(timeout, (self.reconciler)(obj, self.ctx.clone())).await {
            Ok(Ok(action)) => Ok(action),
            Ok(Err(err)) => Err(Error::ReconcilerFailed(err, obj_ref.clone())),
            Err(_) => Err(Error::Timeout(timeout, obj_ref.clone())),
        }
    }
}

/// Decide when `obj_ref` is reconciled next
///
/// Must run before [`WorkQueue::done`] so that an immediate requeue is parked behind the
/// finishing reconciliation rather than racing it.
pub(super) fn schedule<E>(
    queue: &WorkQueue<ObjectRef>,
    obj_ref: &ObjectRef,
    result: &Result<Action, Error<E>>,
    config: &Config,
) where
    E: std::error::Error + Classify + 'static,
{
    match result {
        Ok(Action::Done) => queue.forget(obj_ref),
        Ok(Action::RequeueAfter(delay)) => {
            queue.forget(obj_ref);
            queue.add_after(obj_ref.clone(), *delay);
        }
        Ok(Action::RequeueImmediate) => {
            queue.forget(obj_ref);
            queue.add(obj_ref.clone());
        }
        Err(err) => match err.class() {
            ErrorClass::NotFound => {
                debug!(error = %err, "object vanished during reconcile");
                queue.forget(obj_ref);
            }
            ErrorClass::Conflict => {
                debug!(error = %err, "write conflict, retrying");
                queue.add(obj_ref.clone());
            }
            ErrorClass::Transient | ErrorClass::Timeout => {
                let delay = queue.add_rate_limited(obj_ref.clone());
                warn!(error = %err, ?delay, "reconcile failed, backing off");
            }
            ErrorClass::Permanent => {
                let delay = queue.next_backoff(obj_ref).max(config.resync);
                queue.add_after(obj_ref.clone(), delay);
                warn!(error = %err, ?delay, "reconcile failed permanently, retrying at resync");
            }
        },
    }
}
