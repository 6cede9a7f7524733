//! A rate-limited, de-duplicating work queue
//!
//! The queue hands every item to at most one worker at a time. Adding an item that is already
//! pending is a no-op, and adding an item that is being processed parks it until the worker
//! calls [`WorkQueue::done`], so a flood of triggers for one key collapses into a single
//! follow-up pass.
use crate::utils::RebuildingBackoff;
use ahash::{AHashMap, AHashSet};
use backon::ExponentialBuilder;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    hash::Hash,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{self, Instant},
};

/// Per-item retry backoff settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Delay of the first rate-limited retry
    pub base_delay: Duration,
    /// Ceiling of the rate-limited retry delay
    pub max_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl Config {
    /// Set the delay of the first retry
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the ceiling of the retry delay
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    // No jitter: the delays of one item never decrease until it is forgotten.
    fn backoff(&self) -> RebuildingBackoff<ExponentialBuilder> {
        RebuildingBackoff::new(
            ExponentialBuilder::default()
                .with_min_delay(self.base_delay)
                .with_max_delay(self.max_delay.max(self.base_delay))
                .with_factor(2.0)
                .without_max_times(),
        )
    }
}

struct Backoff {
    requeues: u32,
    delays: RebuildingBackoff<ExponentialBuilder>,
}

struct State<T> {
    ready: VecDeque<T>,
    dirty: AHashSet<T>,
    processing: AHashSet<T>,
    delayed: BTreeMap<(Instant, u64), T>,
    deadlines: AHashMap<T, (Instant, u64)>,
    next_seq: u64,
    backoffs: AHashMap<T, Backoff>,
    shutting_down: bool,
}

impl<T: Hash + Eq + Clone> State<T> {
    /// Returns whether `item` became ready
    fn add(&mut self, item: T) -> bool {
        if self.shutting_down || self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            // parked until `done`
            return false;
        }
        self.ready.push_back(item);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let item = entry.remove();
            self.deadlines.remove(&item);
            self.add(item);
        }
    }
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    config: Config,
}

/// A cloneable handle to a work queue
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkQueue")
            .field("ready", &state.ready.len())
            .field("processing", &state.processing.len())
            .field("delayed", &state.delayed.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T: Hash + Eq + Clone> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<T: Hash + Eq + Clone> WorkQueue<T> {
    /// Create an empty queue
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    ready: VecDeque::new(),
                    dirty: AHashSet::new(),
                    processing: AHashSet::new(),
                    delayed: BTreeMap::new(),
                    deadlines: AHashMap::new(),
                    next_seq: 0,
                    backoffs: AHashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                config,
            }),
        }
    }

    /// Mark `item` as needing processing
    ///
    /// Ignored after [`WorkQueue::shut_down`].
    pub fn add(&self, item: T) {
        let became_ready = self.inner.state.lock().add(item);
        if became_ready {
            self.inner.notify.notify_one();
        }
    }

    /// Add `item` once `delay` has passed
    ///
    /// If the item is already waiting for a deadline, the earlier of the two deadlines wins.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let at = Instant::now() + delay;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            if let Some(&current) = state.deadlines.get(&item) {
                if current.0 <= at {
                    return;
                }
                state.delayed.remove(&current);
            }
            let key = (at, state.next_seq);
            state.next_seq += 1;
            state.deadlines.insert(item.clone(), key);
            state.delayed.insert(key, item);
        }
        // let a sleeping worker pick up the new deadline
        self.inner.notify.notify_one();
    }

    /// Advance the backoff of `item` and return the delay it would be retried after
    pub fn next_backoff(&self, item: &T) -> Duration {
        let mut state = self.inner.state.lock();
        let max_delay = self.inner.config.max_delay;
        let backoff = state.backoffs.entry(item.clone()).or_insert_with(|| Backoff {
            requeues: 0,
            delays: self.inner.config.backoff(),
        });
        backoff.requeues = backoff.requeues.saturating_add(1);
        backoff.delays.next().unwrap_or(max_delay)
    }

    /// Add `item` after its next backoff delay, returning that delay
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = self.next_backoff(&item);
        self.add_after(item, delay);
        delay
    }

    /// Clear the backoff of `item`
    pub fn forget(&self, item: &T) {
        self.inner.state.lock().backoffs.remove(item);
    }

    /// How many times `item` has been rate limited since it was last forgotten
    #[must_use]
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner
            .state
            .lock()
            .backoffs
            .get(item)
            .map_or(0, |backoff| backoff.requeues)
    }

    /// Wait for the next item to process
    ///
    /// The caller owns the item until it calls [`WorkQueue::done`]. Returns `None` once the
    /// queue has been shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            let next_deadline = {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(item) = state.ready.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.ready.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                // register interest before releasing the lock so no wakeup is lost
                notified.as_mut().enable();
                state.delayed.keys().next().map(|(at, _)| *at)
            };
            match next_deadline {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish processing `item`, re-queueing it if it was added in the meantime
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.ready.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Number of items ready to be handed out
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    /// Whether no item is ready to be handed out
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items and wake every waiting [`WorkQueue::get`]
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] was called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}
