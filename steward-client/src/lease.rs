//! Lease records used for leader election.
use std::time::Duration;

use tokio::time::Instant;

/// A time-bounded exclusive claim held by a single identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Name of the lease
    pub name: String,
    /// Current holder, `None` if released
    pub holder_identity: Option<String>,
    /// How long a claim stays valid without renewal
    pub lease_duration: Duration,
    /// When the current holder last acquired or renewed the claim
    pub renew_time: Instant,
    /// Number of times the lease changed hands
    pub lease_transitions: u32,
}

impl Lease {
    /// When the current claim runs out
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.renew_time + self.lease_duration
    }

    /// Whether the claim has run out at `now`
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at() <= now
    }

    /// Whether `identity` holds an unexpired claim at `now`
    #[must_use]
    pub fn is_held_by(&self, identity: &str, now: Instant) -> bool {
        self.holder_identity.as_deref() == Some(identity) && !self.is_expired(now)
    }
}
