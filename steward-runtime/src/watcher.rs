//! Watches a kind of object for changes, with error recovery
//!
//! See [`watcher`] for the primary entry point.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use backon::ExponentialBuilder;
use futures::{stream::BoxStream, Stream, StreamExt};
use steward_client::{Client, Error as ClientError};
use steward_core::{DynamicObject, ErrorResponse, ListParams, ResourceExt, WatchEvent};
use thiserror::Error;
use tracing::{debug, warn};

use crate::utils::{RebuildingBackoff, ResettableBackoff};

#[derive(Debug, Error)]
/// Errors surfaced by a [`watcher`] stream
pub enum Error {
    /// The list call failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] ClientError),
    /// The watch call failed
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] ClientError),
    /// The store sent an error event on an open watch
    #[error("error returned by the store during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    /// The watch stream itself failed
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] ClientError),
}
/// Result alias for the watcher
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone)]
/// Watch events returned from the [`watcher`]
pub enum Event<K = DynamicObject> {
    /// An object was added or modified
    Apply(K),
    /// An object was deleted
    ///
    /// NOTE: This should not be used for managing persistent state elsewhere, since
    /// events may be lost if the watcher is unavailable. Use finalizers instead.
    Delete(K),
    /// The watch stream was restarted
    ///
    /// A series of `InitApply` events are expected to follow until all matching objects
    /// have been listed. This event can be used to prepare a buffer for `InitApply` events.
    Init,
    /// Received an object during `Init`
    ///
    /// Objects returned here are either from the initial stream using the list call,
    /// or from a relist after the watch fell out of the retained history.
    InitApply(K),
    /// The initialisation is complete
    ///
    /// This can be used as a signal to replace buffered store contents atomically.
    /// Any objects that were previously [`Apply`ed](Event::Apply) but are not listed in any of
    /// the `InitApply` events should be assumed to have been [`Delete`d](Event::Delete).
    InitDone,
}

/// Parameters of the list and watch calls made by a [`watcher`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// Restrict the watched objects by their labels, see [`ListParams::label_selector`]
    pub label_selector: Option<String>,
    /// Restrict the watched objects to one namespace
    pub namespace: Option<String>,
}

impl Config {
    /// Configure the selector to restrict the list of returned objects by their labels.
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Only watch a single namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    fn to_list_params(&self) -> ListParams {
        ListParams {
            label_selector: self.label_selector.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

/// The internal finite state machine driving the [`watcher`]
enum State {
    /// The Watcher is empty, and the next poll will start the initial list to get all existing objects
    Empty,
    /// The list call succeeded, listed objects are being emitted one at a time
    InitPage {
        resource_version: String,
        objects: VecDeque<DynamicObject>,
    },
    /// All listed objects were emitted, so we should move on to starting the actual watch.
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just return events from the store.
    ///
    /// If the connection is disrupted then we propagate the error but try to restart the watch stream by
    /// returning to the `InitListed` state.
    /// If we fall out of the retained history then we propagate the error and fall back doing a re-list
    /// with `Empty`.
    Watching {
        resource_version: String,
        stream: BoxStream<'static, steward_client::Result<WatchEvent>>,
    },
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined(
    client: &dyn Client,
    kind: &str,
    lp: &ListParams,
    state: State,
) -> (Option<Result<Event>>, State) {
    match state {
        State::Empty => match client.list(kind, lp).await {
            Ok(list) => {
                debug!(kind, count = list.items.len(), "listed objects");
                (Some(Ok(Event::Init)), State::InitPage {
                    resource_version: list.resource_version,
                    objects: list.items.into(),
                })
            }
            Err(err) => {
                warn!(kind, error = %err, "failed to list objects");
                (Some(Err(Error::InitialListFailed(err))), State::Empty)
            }
        },
        State::InitPage {
            resource_version,
            mut objects,
        } => match objects.pop_front() {
            Some(obj) => (Some(Ok(Event::InitApply(obj))), State::InitPage {
                resource_version,
                objects,
            }),
            None => (Some(Ok(Event::InitDone)), State::InitListed { resource_version }),
        },
        State::InitListed { resource_version } => match client.watch(kind, lp, &resource_version).await {
            Ok(stream) => (None, State::Watching {
                resource_version,
                stream,
            }),
            Err(err) => {
                warn!(kind, error = %err, "failed to start watch");
                (Some(Err(Error::WatchStartFailed(err))), State::InitListed {
                    resource_version,
                })
            }
        },
        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (Some(Ok(Event::Apply(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (Some(Ok(Event::Delete(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Bookmark(bm))) => (None, State::Watching {
                resource_version: bm.resource_version,
                stream,
            }),
            Some(Ok(WatchEvent::Error(err))) => {
                // Gone means the history no longer reaches our version, start over with a fresh list
                let new_state = if err.is_expired() {
                    debug!(kind, "watch resource version expired, relisting");
                    State::Empty
                } else {
                    warn!(kind, error = %err, "watch error");
                    State::Watching {
                        resource_version,
                        stream,
                    }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            Some(Err(err)) => {
                warn!(kind, error = %err, "watch stream failed");
                (Some(Err(Error::WatchFailed(err))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            None => {
                debug!(kind, %resource_version, "watch closed, resuming");
                (None, State::InitListed { resource_version })
            }
        },
    }
}

/// Trampoline helper for `step_trampolined`
async fn step(client: &dyn Client, kind: &str, lp: &ListParams, mut state: State) -> (Result<Event>, State) {
    loop {
        match step_trampolined(client, kind, lp, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches objects of one kind for changes continuously
///
/// Compared to [`Client::watch`], this automatically tries to recover the stream upon errors.
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery mode on the next poll.
/// You can apply your own backoff by not polling the stream for a duration after errors,
/// or use [`WatchStreamExt::default_backoff`](crate::WatchStreamExt::default_backoff).
///
/// This is intended to provide a safe and atomic input interface for a state store like a
/// [`reflector`](crate::reflector::reflector).
///
/// ```no_run
/// use std::sync::Arc;
/// use futures::TryStreamExt;
/// use steward_client::MemoryStore;
/// use steward_runtime::{watcher, WatchStreamExt};
/// # async fn wrapper() -> Result<(), steward_runtime::watcher::Error> {
/// let client = Arc::new(MemoryStore::new());
/// watcher(client, "Replicated", watcher::Config::default())
///     .default_backoff()
///     .try_for_each(|event| async move {
///         println!("{event:?}");
///         Ok(())
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// # Recovery
///
/// If the watch connection is interrupted then we attempt to restart the watch using the last
/// resource version that we have seen on the stream. If this is successful then the stream is
/// simply resumed from where it left off. If this fails because the resource version is no longer
/// retained then we start over with a new list, starting with an [`Event::Init`].
pub fn watcher(
    client: Arc<dyn Client>,
    kind: &str,
    config: Config,
) -> impl Stream<Item = Result<Event>> + Send {
    futures::stream::unfold(
        (client, kind.to_string(), config.to_list_params(), State::Empty),
        |(client, kind, lp, state)| async {
            let (event, state) = step(client.as_ref(), &kind, &lp, state).await;
            Some((event, (client, kind, lp, state)))
        },
    )
}

/// Backoff used by [`WatchStreamExt::default_backoff`](crate::WatchStreamExt::default_backoff)
///
/// Starts at 800ms and doubles up to 30s between relist attempts, and starts over once the
/// store answers again.
#[derive(Debug)]
pub struct DefaultBackoff(RebuildingBackoff<ExponentialBuilder>);

impl Default for DefaultBackoff {
    fn default() -> Self {
        Self(RebuildingBackoff::new(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(800))
                .with_max_delay(Duration::from_secs(30))
                .with_factor(2.0)
                .with_jitter()
                .without_max_times(),
        ))
    }
}

impl Iterator for DefaultBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl ResettableBackoff for DefaultBackoff {
    fn reset(&mut self) {
        self.0.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{pin_mut, StreamExt};
    use serde_json::json;
    use steward_client::MemoryStore;

    fn replicated(name: &str) -> DynamicObject {
        DynamicObject::new("Replicated", name)
            .within("default")
            .spec(json!({ "replicas": 1 }))
    }

    async fn next(stream: &mut (impl Stream<Item = Result<Event>> + Unpin)) -> Result<Event> {
        stream.next().await.expect("watcher streams never end")
    }

    #[tokio::test]
    async fn lists_then_watches() {
        let store = MemoryStore::new();
        store.create(&replicated("a")).await.unwrap();
        let stream = watcher(Arc::new(store.clone()), "Replicated", Config::default());
        pin_mut!(stream);

        assert!(matches!(next(&mut stream).await, Ok(Event::Init)));
        assert!(matches!(next(&mut stream).await, Ok(Event::InitApply(obj)) if obj.name_any() == "a"));
        assert!(matches!(next(&mut stream).await, Ok(Event::InitDone)));

        store.create(&replicated("b")).await.unwrap();
        assert!(matches!(next(&mut stream).await, Ok(Event::Apply(obj)) if obj.name_any() == "b"));
        store.delete("Replicated", Some("default"), "a").await.unwrap();
        assert!(matches!(next(&mut stream).await, Ok(Event::Delete(obj)) if obj.name_any() == "a"));
    }

    #[tokio::test]
    async fn resumes_after_disconnect_without_relisting() {
        let store = MemoryStore::new();
        let stream = watcher(Arc::new(store.clone()), "Replicated", Config::default());
        pin_mut!(stream);
        assert!(matches!(next(&mut stream).await, Ok(Event::Init)));
        assert!(matches!(next(&mut stream).await, Ok(Event::InitDone)));

        store.create(&replicated("a")).await.unwrap();
        assert!(matches!(next(&mut stream).await, Ok(Event::Apply(_))));
        store.disconnect_watches();
        store.create(&replicated("b")).await.unwrap();
        // the resumed watch replays from the last seen version
        assert!(matches!(next(&mut stream).await, Ok(Event::Apply(obj)) if obj.name_any() == "b"));
    }

    #[tokio::test]
    async fn relists_when_history_expired() {
        let store = MemoryStore::new();
        let stream = watcher(Arc::new(store.clone()), "Replicated", Config::default());
        pin_mut!(stream);
        assert!(matches!(next(&mut stream).await, Ok(Event::Init)));
        assert!(matches!(next(&mut stream).await, Ok(Event::InitDone)));

        store.create(&replicated("a")).await.unwrap();
        assert!(matches!(next(&mut stream).await, Ok(Event::Apply(_))));
        store.disconnect_watches();
        store.create(&replicated("b")).await.unwrap();
        store.compact();

        assert!(matches!(next(&mut stream).await, Err(Error::WatchError(err)) if err.is_expired()));
        assert!(matches!(next(&mut stream).await, Ok(Event::Init)));
        let mut names = vec![];
        while let Ok(Event::InitApply(obj)) = next(&mut stream).await {
            names.push(obj.name_any());
        }
        assert_eq!(names, ["a", "b"]);
    }

    #[tokio::test]
    async fn list_failures_are_surfaced_and_retried() {
        let store = MemoryStore::new();
        store.inject_error(steward_client::Verb::List, ErrorResponse::unavailable("down"));
        let stream = watcher(Arc::new(store.clone()), "Replicated", Config::default());
        pin_mut!(stream);
        assert!(matches!(next(&mut stream).await, Err(Error::InitialListFailed(_))));
        assert!(matches!(next(&mut stream).await, Ok(Event::Init)));
    }
}
