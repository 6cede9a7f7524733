#![allow(dead_code, missing_docs)]

use futures::{Future, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use steward_client::{Client, MemoryStore};
use steward_core::{
    conditions::remove_condition, Condition, ConditionStatus, DynamicObject, ParseSpecError,
    ResourceExt,
};
use steward_runtime::{
    controller::{self, Action},
    dependents::{self, apply_dependent},
    finalizer::{self, finalizer, Event},
    status::{report_degraded, update_status, DEGRADED},
    Classify, Controller, ErrorClass, GarbageCollector,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const NS: &str = "default";
pub const CLEANUP: &str = "core/cleanup";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Poll `check` until it holds, panicking after a minute of (usually paused) time
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn replicated(name: &str, replicas: serde_json::Value) -> DynamicObject {
    DynamicObject::new("Replicated", name)
        .within(NS)
        .spec(json!({ "replicas": replicas }))
}

pub async fn get(client: &MemoryStore, kind: &str, name: &str) -> Option<DynamicObject> {
    client.get_opt(kind, Some(NS), name).await.unwrap()
}

pub fn condition(obj: &DynamicObject, type_: &str) -> Option<Condition> {
    obj.status.as_ref().and_then(|s| s.condition(type_)).cloned()
}

/// Play the part of whatever runs replicas, and report them ready
pub async fn mark_ready(client: &MemoryStore, name: &str) {
    let mut replica = get(client, "Replica", name).await.unwrap();
    replica
        .status_mut()
        .fields
        .insert("ready".into(), json!(true));
    client.replace_status(&replica).await.unwrap();
}

#[derive(Deserialize)]
struct ReplicatedSpec {
    replicas: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store request failed: {0}")]
    Client(#[from] steward_client::Error),
    #[error("failed to apply replica: {0}")]
    Dependent(#[from] dependents::Error),
    #[error(transparent)]
    MalformedSpec(#[from] ParseSpecError),
    #[error("waiting for {0} dependents to go away")]
    Blocked(usize),
    #[error("cleanup is not allowed yet")]
    Refused,
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::Client(err) => err.class(),
            Error::Dependent(err) => err.class(),
            Error::MalformedSpec(err) => err.class(),
            Error::Blocked(_) | Error::Refused => ErrorClass::Transient,
        }
    }
}

/// State shared by the `Replicated` reconciler
pub struct Ctx {
    pub client: Arc<dyn Client>,
    pub gc: GarbageCollector,
    pub finalizer: &'static str,
    pub resync: Duration,
    pub applies: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub allow_cleanup: AtomicBool,
}

impl Ctx {
    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

/// Keeps `spec.replicas` ready `Replica` dependents per `Replicated` object
pub async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<Ctx>) -> Result<Action, finalizer::Error<Error>> {
    let client = ctx.client.clone();
    finalizer(client.as_ref(), ctx.finalizer, obj, |event| async move {
        match event {
            Event::Apply(obj) => apply(&obj, &ctx).await,
            Event::Cleanup(obj) => cleanup(&obj, &ctx),
        }
    })
    .await
}

async fn apply(obj: &DynamicObject, ctx: &Ctx) -> Result<Action, Error> {
    ctx.applies.fetch_add(1, Ordering::SeqCst);
    let client = ctx.client.as_ref();
    let spec = match obj.parse_spec::<ReplicatedSpec>() {
        Ok(spec) => spec,
        Err(err) => {
            report_degraded(client, obj, "MalformedSpec", &err.to_string()).await?;
            return Err(err.into());
        }
    };
    let name = obj.name_any();
    let mut ready = 0;
    for index in 0..spec.replicas {
        let desired = DynamicObject::new("Replica", &format!("{name}-{index}"))
            .label("app", &name)
            .spec(json!({ "index": index }));
        let applied = apply_dependent(client, obj, desired).await?;
        let replica = applied.object();
        if replica.status.as_ref().and_then(|s| s.fields.get("ready")) == Some(&json!(true)) {
            ready += 1;
        }
    }
    let available = if ready == spec.replicas {
        Condition::new("Available", ConditionStatus::True, "Ready", "all replicas are ready")
    } else {
        Condition::new("Available", ConditionStatus::False, "Creating", "waiting for replicas")
    };
    let generation = obj.generation();
    update_status(client, obj, |status| {
        status.observed_generation = Some(generation);
        status.set_condition(available.clone());
        remove_condition(&mut status.conditions, DEGRADED);
    })
    .await?;
    Ok(Action::requeue_after(ctx.resync))
}

fn cleanup(obj: &DynamicObject, ctx: &Ctx) -> Result<Action, Error> {
    if !ctx.allow_cleanup.load(Ordering::SeqCst) {
        return Err(Error::Refused);
    }
    let blocking = ctx.gc.blocking_dependents(obj);
    if !blocking.is_empty() {
        return Err(Error::Blocked(blocking.len()));
    }
    ctx.cleanups.fetch_add(1, Ordering::SeqCst);
    Ok(Action::Done)
}

pub struct Running {
    pub ctx: Arc<Ctx>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<Vec<controller::ReconcileReport<finalizer::Error<Error>>>>,
}

impl Running {
    /// Stop the controller and collect every report it produced
    pub async fn stop(self) -> Vec<controller::ReconcileReport<finalizer::Error<Error>>> {
        self.shutdown.cancel();
        self.handle.await.unwrap()
    }
}

/// Start the `Replicated` controller on `client`
pub fn start(client: &MemoryStore, finalizer: &'static str, config: controller::Config) -> Running {
    let client: Arc<dyn Client> = Arc::new(client.clone());
    let shutdown = CancellationToken::new();
    let controller = Controller::new(client.clone(), "Replicated")
        .owns("Replica")
        .with_config(config.clone())
        .shutdown_on(shutdown.clone());
    let ctx = Arc::new(Ctx {
        client,
        gc: controller.garbage_collector(),
        finalizer,
        resync: config.resync,
        applies: AtomicUsize::new(0),
        cleanups: AtomicUsize::new(0),
        allow_cleanup: AtomicBool::new(true),
    });
    let handle = tokio::spawn(controller.run(reconcile, ctx.clone()).collect::<Vec<_>>());
    Running { ctx, shutdown, handle }
}

pub fn fast_config() -> controller::Config {
    controller::Config::default()
        .resync(Duration::from_secs(60))
        .gc_interval(Some(Duration::from_secs(1)))
}
