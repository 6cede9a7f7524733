//! Controllers gated by leader election
mod common;

use common::{eventually, NS};
use futures::StreamExt;
use parking_lot::Mutex;
use std::{convert::Infallible, sync::Arc, time::Duration};
use steward_client::{Client, MemoryStore};
use steward_core::{DynamicObject, ResourceExt};
use steward_runtime::{
    coordination::{ConfigBuilder, LeaderElectorHandle},
    Action, Classify, Controller, ErrorClass, LeaderElector, LeaderState,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
#[error("unreachable")]
struct Never(Infallible);

impl Classify for Never {
    fn class(&self) -> ErrorClass {
        match self.0 {}
    }
}

type Log = Arc<Mutex<Vec<(&'static str, String)>>>;

struct Replica {
    identity: &'static str,
    log: Log,
}

async fn record(obj: Arc<DynamicObject>, ctx: Arc<Replica>) -> Result<Action, Never> {
    ctx.log.lock().push((ctx.identity, obj.name_any()));
    Ok(Action::Done)
}

fn elect(client: &MemoryStore, identity: &str) -> LeaderElectorHandle {
    let config = ConfigBuilder::new("jobs", identity)
        .timings(
            Duration::from_millis(1000),
            Duration::from_millis(600),
            Duration::from_millis(200),
        )
        .finish()
        .unwrap();
    LeaderElector::spawn(config, Arc::new(client.clone()))
}

async fn wait_for(mut rx: watch::Receiver<LeaderState>, leading: bool) {
    loop {
        if rx.borrow_and_update().is_leader() == leading {
            return;
        }
        rx.changed().await.unwrap();
    }
}

fn controller(client: &MemoryStore, identity: &'static str, leader: &LeaderElectorHandle, log: &Log, shutdown: &CancellationToken) {
    let ctx = Arc::new(Replica {
        identity,
        log: log.clone(),
    });
    let run = Controller::new(Arc::new(client.clone()), "Job")
        .leader_election(leader.state())
        .shutdown_on(shutdown.clone())
        .run(record, ctx)
        .for_each(|_| async {});
    tokio::spawn(run);
}

fn seen_by(log: &Log, name: &str) -> Vec<&'static str> {
    log.lock()
        .iter()
        .filter(|(_, seen)| seen == name)
        .map(|(identity, _)| *identity)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn only_the_leader_reconciles() {
    let client = MemoryStore::new();
    let log = Log::default();
    let shutdown = CancellationToken::new();

    let a = elect(&client, "a");
    wait_for(a.state(), true).await;
    let b = elect(&client, "b");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!b.state().borrow().is_leader());
    controller(&client, "a", &a, &log, &shutdown);
    controller(&client, "b", &b, &log, &shutdown);

    client
        .create(&DynamicObject::new("Job", "one").within(NS))
        .await
        .unwrap();
    let log_ref = &log;
    eventually("the leader to reconcile", || async move { !seen_by(log_ref, "one").is_empty() }).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(seen_by(&log, "one"), ["a"]);

    // a steps down, its workers halt while b takes over
    let a_state = a.state();
    a.shutdown().await.unwrap();
    wait_for(a_state, false).await;
    let handled_by_a = log.lock().iter().filter(|(identity, _)| *identity == "a").count();
    wait_for(b.state(), true).await;

    client
        .create(&DynamicObject::new("Job", "two").within(NS))
        .await
        .unwrap();
    eventually("the new leader to reconcile", || async move { !seen_by(log_ref, "two").is_empty() }).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(seen_by(&log, "two"), ["b"]);
    assert_eq!(
        log.lock().iter().filter(|(identity, _)| *identity == "a").count(),
        handled_by_a,
        "a follower kept reconciling"
    );

    shutdown.cancel();
    b.shutdown().await.unwrap();
    let lease = client.get_lease("jobs").await.unwrap().unwrap();
    assert!(lease.holder_identity.is_none());
}
