//! Keeps `spec.replicas` ready `Replica` objects per `Replicated` object
//!
//! Runs against an in-memory store. A simulated scheduler marks replicas ready, and a short
//! scripted scenario creates, scales and deletes a `Replicated` object while the controller
//! converges.
use clap::Parser;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use steward_client::{Client, MemoryStore};
use steward_core::{
    conditions::remove_condition, Condition, ConditionStatus, DynamicObject, ParseSpecError,
    ResourceExt,
};
use steward_runtime::{
    controller::{self, Action},
    coordination::ConfigBuilder,
    dependents::{self, apply_dependent},
    finalizer::{finalizer, Event},
    reflector::OWNER_UID_INDEX,
    status::{report_degraded, update_status, DEGRADED},
    Classify, Controller, ErrorClass, GarbageCollector, LeaderElector, Store,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const FINALIZER: &str = "core/cleanup";

#[derive(Parser)]
#[command(about = "Run the Replicated controller against an in-memory store")]
struct Opts {
    /// Replicas requested by the scripted scenario
    #[arg(long, env = "REPLICATOR_REPLICAS", default_value_t = 3)]
    replicas: u32,
    /// Number of concurrent reconcilers
    #[arg(long, env = "REPLICATOR_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,
    /// Seconds between periodic reconciliations of converged objects
    #[arg(long, env = "REPLICATOR_RESYNC_SECS", default_value_t = 30)]
    resync_secs: u64,
    /// Identity used for leader election, random if unset
    #[arg(long, env = "REPLICATOR_IDENTITY")]
    identity: Option<String>,
    /// Namespace of the scripted objects
    #[arg(long, env = "REPLICATOR_NAMESPACE", default_value = "default")]
    namespace: String,
    /// Keep running after the scenario until interrupted
    #[arg(long)]
    serve: bool,
}

#[derive(Deserialize)]
struct ReplicatedSpec {
    replicas: u32,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("store request failed: {0}")]
    Client(#[from] steward_client::Error),
    #[error("failed to apply replica: {0}")]
    Dependent(#[from] dependents::Error),
    #[error(transparent)]
    MalformedSpec(#[from] ParseSpecError),
    #[error("{0} replicas still block deletion")]
    Blocked(usize),
}

impl Classify for Error {
    fn class(&self) -> ErrorClass {
        match self {
            Error::Client(err) => err.class(),
            Error::Dependent(err) => err.class(),
            Error::MalformedSpec(err) => err.class(),
            Error::Blocked(_) => ErrorClass::Transient,
        }
    }
}

// Data we want access to in reconcile calls
struct Data {
    client: Arc<dyn Client>,
    replicas: Store,
    gc: GarbageCollector,
    resync: Duration,
}

/// Controller triggers this whenever our main object or our replicas changed
async fn reconcile(
    obj: Arc<DynamicObject>,
    ctx: Arc<Data>,
) -> Result<Action, steward_runtime::finalizer::Error<Error>> {
    let client = ctx.client.clone();
    finalizer(client.as_ref(), FINALIZER, obj, |event| async move {
        match event {
            Event::Apply(obj) => apply(&obj, &ctx).await,
            Event::Cleanup(obj) => cleanup(&obj, &ctx),
        }
    })
    .await
}

async fn apply(obj: &DynamicObject, ctx: &Data) -> Result<Action, Error> {
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
        let replica = apply_dependent(client, obj, desired).await?;
        if is_ready(replica.object()) {
            ready += 1;
        }
    }
    scale_down(obj, spec.replicas, ctx).await?;

    let available = if ready == spec.replicas {
        Condition::new("Available", ConditionStatus::True, "Ready", "all replicas are ready")
    } else {
        let message = format!("{ready}/{} replicas ready", spec.replicas);
        Condition::new("Available", ConditionStatus::False, "Creating", &message)
    };
    let generation = obj.generation();
    update_status(client, obj, |status| {
        status.observed_generation = Some(generation);
        status.fields.insert("readyReplicas".into(), json!(ready));
        status.set_condition(available.clone());
        remove_condition(&mut status.conditions, DEGRADED);
    })
    .await?;
    Ok(Action::requeue_after(ctx.resync))
}

/// Delete replicas beyond the requested count
async fn scale_down(obj: &DynamicObject, replicas: u32, ctx: &Data) -> Result<(), Error> {
    let Some(uid) = obj.uid() else { return Ok(()) };
    for replica in ctx.replicas.by_index(OWNER_UID_INDEX, &uid) {
        let surplus = replica.spec["index"].as_u64().is_none_or(|index| index >= u64::from(replicas));
        if surplus && !replica.is_terminating() {
            info!(replica = %replica.name_any(), "scaling down");
            match ctx
                .client
                .delete("Replica", replica.metadata.namespace.as_deref(), &replica.name_any())
                .await
            {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {}
            }
        }
    }
    Ok(())
}

fn cleanup(obj: &DynamicObject, ctx: &Data) -> Result<Action, Error> {
    let blocking = ctx.gc.blocking_dependents(obj);
    if !blocking.is_empty() {
        return Err(Error::Blocked(blocking.len()));
    }
    info!(object = %obj.name_any(), "replicas gone, releasing");
    Ok(Action::Done)
}

fn is_ready(replica: &DynamicObject) -> bool {
    replica.status.as_ref().and_then(|s| s.fields.get("ready")) == Some(&json!(true))
}

/// Stand-in for whatever runs replicas: reports every replica ready shortly after it appears
async fn simulate_scheduler(client: MemoryStore, replicas: Store, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        for replica in replicas.state() {
            if is_ready(&replica) || replica.is_terminating() {
                continue;
            }
            let mut next = (*replica).clone();
            next.status_mut().fields.insert("ready".into(), json!(true));
            if let Err(err) = client.replace_status(&next).await {
                warn!(error = %err, replica = %replica.name_any(), "failed to report replica ready");
            }
        }
    }
}

async fn wait_until(
    client: &MemoryStore,
    what: &str,
    check: impl Fn(Option<&DynamicObject>) -> bool,
    ns: &str,
) -> anyhow::Result<()> {
    info!("waiting for {what}");
    loop {
        let x = client.get_opt("Replicated", Some(ns), "x").await?;
        if check(x.as_ref()) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn available(x: Option<&DynamicObject>) -> bool {
    x.and_then(|x| x.status.as_ref())
        .and_then(|s| s.condition("Available"))
        .is_some_and(Condition::is_true)
}

/// Create, scale and delete a `Replicated` object
async fn scenario(client: MemoryStore, opts: &Opts) -> anyhow::Result<()> {
    let ns = opts.namespace.as_str();
    let x = DynamicObject::new("Replicated", "x")
        .within(ns)
        .spec(json!({ "replicas": opts.replicas }));
    client.create(&x).await?;
    wait_until(&client, "x to become available", available, ns).await?;

    let mut x = client.get("Replicated", Some(ns), "x").await?;
    x.spec = json!({ "replicas": 1 });
    let x = client.replace(&x).await?;
    let generation = x.generation();
    wait_until(
        &client,
        "x to scale down",
        |x| {
            available(x)
                && x.and_then(|x| x.status.as_ref())
                    .is_some_and(|s| s.observed_generation == Some(generation))
        },
        ns,
    )
    .await?;

    client.delete("Replicated", Some(ns), "x").await?;
    wait_until(&client, "x to be purged", |x| x.is_none(), ns).await?;
    let leftovers = client.list("Replica", &Default::default()).await?.items;
    info!(leftovers = leftovers.len(), "scenario complete");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,steward=debug".into()),
        )
        .init();
    let opts = Opts::parse();
    let identity = opts
        .identity
        .clone()
        .unwrap_or_else(|| format!("replicator-{}", uuid::Uuid::new_v4()));

    let store = MemoryStore::new();
    let client: Arc<dyn Client> = Arc::new(store.clone());
    let shutdown = CancellationToken::new();

    let elector = LeaderElector::spawn(ConfigBuilder::new("replicator", &identity).finish()?, client.clone());
    let controller = Controller::new(client.clone(), "Replicated")
        .owns("Replica")
        .with_config(
            controller::Config::default()
                .concurrency(opts.concurrency)
                .resync(Duration::from_secs(opts.resync_secs)),
        )
        .leader_election(elector.state())
        .shutdown_on(shutdown.clone());
    let replicas = controller
        .store("Replica")
        .ok_or_else(|| anyhow::anyhow!("Replica is not watched"))?;
    let ctx = Arc::new(Data {
        client,
        replicas: replicas.clone(),
        gc: controller.garbage_collector(),
        resync: Duration::from_secs(opts.resync_secs),
    });
    let reports = tokio::spawn(controller.run(reconcile, ctx).for_each(|report| async move {
        match report.result {
            Ok(action) => info!(object = %report.obj_ref, ?action, "reconciled"),
            Err(err) => warn!(object = %report.obj_ref, class = ?err.class(), "reconcile failed: {err}"),
        }
    }));
    tokio::spawn(simulate_scheduler(store.clone(), replicas, shutdown.clone()));

    tokio::select! {
        res = scenario(store, &opts) => res?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    if opts.serve {
        tokio::signal::ctrl_c().await?;
    }

    shutdown.cancel();
    reports.await?;
    elector.shutdown().await?;
    info!("stopped");
    Ok(())
}
