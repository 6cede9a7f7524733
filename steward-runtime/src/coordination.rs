//! Lease based leader election
//!
//! Every process running a [`LeaderElector`] competes for one named lease in the store. The
//! elector publishes its view of the election on a watch channel, which controllers use to
//! decide whether they may process work:
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//! use steward_client::MemoryStore;
//! use steward_runtime::coordination::{ConfigBuilder, LeaderElector};
//! # async fn wrapper() -> Result<(), steward_runtime::coordination::Error> {
//! let config = ConfigBuilder::new("replicator", "replicator-0").finish()?;
//! let handle = LeaderElector::spawn(config, Arc::new(MemoryStore::new()));
//! let state = handle.state();
//! if state.borrow().is_leader() {
//!     // only perform leader actions while leading
//! }
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The elector only trusts its local clock. A leader that fails to renew within
//! `renew_deadline` steps down on its own, which is strictly before its lease can expire for
//! the other candidates because `renew_deadline < lease_duration`. This does not give fencing:
//! a leader stalled between two checks may still act briefly after the lease has moved on.

use std::{future::Future, sync::Arc, time::Duration};

use futures::TryFutureExt;
use rand::Rng;
use steward_client::{Client, Error as ClientError};
use thiserror::Error;
use tracing::Instrument;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{timeout, Instant},
};

/// The jitter factor to use while attempting to acquire the lease.
const JITTER_FACTOR: f64 = 1.2;

/// Coordination error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration violates the timing constraints
    #[error("invalid leader election config: {0}")]
    ConfigError(String),
    /// A lease call did not complete within the api timeout
    #[error("timeout while updating lease")]
    TimeoutError,
    /// A lease call failed
    #[error("client error from lease call: {0}")]
    ClientError(#[source] ClientError),
    /// The elector task panicked or was cancelled
    #[error("error from the leader elector task: {0}")]
    TaskError(String),
}

/// Coordination result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fully validated configuration for use by a `LeaderElector` instance.
///
/// Construct an instance via `ConfigBuilder::finish()`.
#[derive(Clone, Debug)]
pub struct Config(ConfigBuilder);

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    /// The name of the lease.
    pub name: String,
    /// The identity to use when the lease is acquired.
    ///
    /// Must be unique among the competing processes.
    pub identity: String,
    /// How long a lease stays valid after its last renewal.
    ///
    /// Candidates wait this long after the last renewal before they can take over.
    /// Defaults to 15 seconds.
    pub lease_duration: Duration,
    /// How long the leader keeps retrying renewal before stepping down.
    ///
    /// Defaults to 10 seconds.
    pub renew_deadline: Duration,
    /// The duration between attempts, for leaders and followers alike.
    ///
    /// Defaults to 2 seconds.
    pub retry_period: Duration,
    /// Timeout of a single lease call.
    pub api_timeout: Duration,
}

impl ConfigBuilder {
    /// Start from the default timings
    #[must_use]
    pub fn new(name: &str, identity: &str) -> Self {
        Self {
            name: name.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            api_timeout: Duration::from_secs(5),
        }
    }

    /// Set all timings at once
    #[must_use]
    pub fn timings(mut self, lease_duration: Duration, renew_deadline: Duration, retry_period: Duration) -> Self {
        self.lease_duration = lease_duration;
        self.renew_deadline = renew_deadline;
        self.retry_period = retry_period;
        self
    }

    /// Set the timeout of a single lease call
    #[must_use]
    pub fn api_timeout(mut self, api_timeout: Duration) -> Self {
        self.api_timeout = api_timeout;
        self
    }

    /// Finish building leader elector config by validating this config builder.
    ///
    /// # Errors
    /// Will return `Error::ConfigError` if this member's fields are invalid according to the
    /// following constraints:
    /// - `identity` must not be an empty string;
    /// - `lease_duration` must be greater than `renew_deadline`;
    /// - `renew_deadline` must be greater than `JITTER_FACTOR * retry_period`;
    /// - every duration must be at least 1 millisecond.
    pub fn finish(self) -> Result<Config> {
        if self.identity.is_empty() {
            return Err(Error::ConfigError("identity may not be empty".into()));
        }
        if self.name.is_empty() {
            return Err(Error::ConfigError("name may not be empty".into()));
        }
        for (field, value) in [
            ("lease_duration", self.lease_duration),
            ("renew_deadline", self.renew_deadline),
            ("retry_period", self.retry_period),
            ("api_timeout", self.api_timeout),
        ] {
            if value < Duration::from_millis(1) {
                return Err(Error::ConfigError(format!("{field} must be at least 1 millisecond")));
            }
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::ConfigError(
                "lease_duration must be greater than renew_deadline".into(),
            ));
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(Error::ConfigError(format!(
                "renew_deadline must be greater than retry_period*{JITTER_FACTOR}"
            )));
        }
        Ok(Config(self))
    }
}

/// Different states which a leader elector may be in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaderState {
    /// Another process holds the lease, or this one could not reach the store.
    Follower,
    /// An acquisition attempt is in flight.
    Candidate,
    /// This process holds the lease.
    Leader,
}

impl LeaderState {
    /// Check if currently in `Leader` state.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// A task which is responsible for acquiring and maintaining a lease to establish leadership.
pub struct LeaderElector {
    client: Arc<dyn Client>,
    config: ConfigBuilder,
    state_tx: watch::Sender<LeaderState>,
    /// The start of the last acquisition or renewal that succeeded while leading.
    last_renew: Option<Instant>,
    shutdown: oneshot::Receiver<()>,
}

impl LeaderElector {
    /// Create a new `LeaderElector` instance & spawn it onto the runtime for execution.
    #[must_use = "handle must be used for observing state changes and graceful shutdown"]
    pub fn spawn(config: Config, client: Arc<dyn Client>) -> LeaderElectorHandle {
        let (state_tx, state_rx) = watch::channel(LeaderState::Candidate);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let this = LeaderElector {
            client,
            config: config.0,
            state_tx,
            last_renew: None,
            shutdown: shutdown_rx,
        };
        let span = tracing::info_span!("leader_elector", lease = %this.config.name, identity = %this.config.identity);
        let handle = tokio::spawn(this.run().instrument(span));
        LeaderElectorHandle {
            shutdown: shutdown_tx,
            state: state_rx,
            handle,
        }
    }

    async fn run(mut self) {
        tracing::info!("leader elector task started");
        loop {
            let delay = match self.last_renew {
                None => self.try_acquire().await,
                Some(last_renew) => self.try_renew(last_renew).await,
            };
            tracing::trace!(?delay, "waiting for next lease attempt");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = &mut self.shutdown => break,
            }
        }
        if self.last_renew.take().is_some() {
            match self.call(self.client.release_lease(&self.config.name, &self.config.identity)).await {
                Ok(_) => tracing::info!("released lease"),
                Err(err) => tracing::warn!(error = %err, "failed to release lease, it will expire"),
            }
        }
        self.set_state(LeaderState::Follower);
        tracing::info!("leader elector task terminated");
    }

    /// Attempt to take the lease, returning the delay until the next attempt
    async fn try_acquire(&mut self) -> Duration {
        self.set_state(LeaderState::Candidate);
        let started = Instant::now();
        let acquired = self
            .call(self.client.acquire_lease(
                &self.config.name,
                &self.config.identity,
                self.config.lease_duration,
            ))
            .await;
        match acquired {
            Ok(true) => {
                tracing::info!("acquired lease");
                self.last_renew = Some(started);
                self.set_state(LeaderState::Leader);
                self.config.retry_period
            }
            Ok(false) => {
                tracing::debug!("lease is held by another candidate");
                self.set_state(LeaderState::Follower);
                self.follower_delay()
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to acquire lease");
                self.set_state(LeaderState::Follower);
                self.follower_delay()
            }
        }
    }

    /// Attempt to extend the lease, stepping down if that has not worked for `renew_deadline`
    async fn try_renew(&mut self, last_renew: Instant) -> Duration {
        let deadline = last_renew + self.config.renew_deadline;
        let started = Instant::now();
        let remaining = deadline.saturating_duration_since(started);
        if remaining.is_zero() {
            return self.step_down("renew deadline passed");
        }
        let renewed = match timeout(
            self.config.api_timeout.min(remaining),
            self.client.renew_lease(
                &self.config.name,
                &self.config.identity,
                self.config.lease_duration,
            ),
        )
        .await
        {
            Ok(res) => res.map_err(Error::ClientError),
            Err(_elapsed) => Err(Error::TimeoutError),
        };
        match renewed {
            Ok(true) => {
                tracing::trace!("renewed lease");
                self.last_renew = Some(started);
                self.config.retry_period
            }
            Ok(false) => self.step_down("lease was taken over"),
            Err(err) if Instant::now() >= deadline => {
                tracing::warn!(error = %err, "failed to renew lease");
                self.step_down("renew deadline passed")
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to renew lease, retrying");
                self.config
                    .retry_period
                    .min(deadline.saturating_duration_since(Instant::now()))
            }
        }
    }

    fn step_down(&mut self, reason: &str) -> Duration {
        tracing::warn!(reason, "stepping down as leader");
        self.last_renew = None;
        self.set_state(LeaderState::Follower);
        self.follower_delay()
    }

    /// The retry period plus jitter, spreading out competing candidates
    fn follower_delay(&self) -> Duration {
        let factor = rand::rng().random_range(1.0..JITTER_FACTOR);
        self.config.retry_period.mul_f64(factor)
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T, ClientError>>) -> Result<T> {
        timeout(self.config.api_timeout, fut)
            .await
            .map_err(|_elapsed| Error::TimeoutError)?
            .map_err(Error::ClientError)
    }

    fn set_state(&self, state: LeaderState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = ?current, to = ?state, "leader state changed");
                *current = state;
                true
            }
        });
    }
}

/// A handle to a leader elector task.
pub struct LeaderElectorHandle {
    /// Shutdown channel.
    shutdown: oneshot::Sender<()>,
    /// A watch signal over the observed leader state.
    state: watch::Receiver<LeaderState>,
    /// A join handle to the spawned leader elector task.
    handle: JoinHandle<()>,
}

impl LeaderElectorHandle {
    /// Get a handle to the state signal of this leader elector task.
    ///
    /// This signal receiver may be handed to controllers and used to govern actions
    /// taken by the app in accordance with leader election state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    /// Shutdown this leader elector task, releasing the lease if held.
    pub fn shutdown(self) -> impl Future<Output = Result<()>> {
        let _res = self.shutdown.send(());
        self.handle.map_err(|res| Error::TaskError(res.to_string()))
    }
}
