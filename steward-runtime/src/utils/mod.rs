//! Helpers for manipulating built-in streams

mod backoff_resettable;
mod stream_backoff;
mod watch_ext;

pub use backoff_resettable::{RebuildingBackoff, ResettableBackoff};
pub use stream_backoff::StreamBackoff;
pub use watch_ext::WatchStreamExt;

use std::future::Future;
use tokio::sync::watch;

use crate::coordination::LeaderState;

/// Resolves once the leadership signal reports `leading`
///
/// Stays pending forever if the elector is gone, callers are expected to race this
/// against their own shutdown signal.
pub(crate) async fn until_leadership(rx: &mut watch::Receiver<LeaderState>, leading: bool) {
    loop {
        if rx.borrow_and_update().is_leader() == leading {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs `fut` unless `rx` is present and stops reporting leadership first
pub(crate) async fn while_leading<F: Future>(
    rx: Option<&mut watch::Receiver<LeaderState>>,
    fut: F,
) -> Option<F::Output> {
    match rx {
        None => Some(fut.await),
        Some(rx) => tokio::select! {
            biased;
            () = until_leadership(rx, false) => None,
            out = fut => Some(out),
        },
    }
}
