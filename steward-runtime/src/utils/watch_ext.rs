use crate::{
    utils::{stream_backoff::StreamBackoff, ResettableBackoff},
    watcher::DefaultBackoff,
};

use futures::{Stream, TryStream};

/// Extension trait for streams returned by [`watcher`](crate::watcher()) or [`reflector`](crate::reflector::reflector)
pub trait WatchStreamExt: Stream {
    /// Apply the [`DefaultBackoff`] watcher policy
    ///
    /// This is recommended for controllers that want to retry list and watch failures forever.
    fn default_backoff(self) -> StreamBackoff<Self, DefaultBackoff>
    where
        Self: TryStream + Sized,
    {
        StreamBackoff::new(self, DefaultBackoff::default())
    }

    /// Apply a specific [`ResettableBackoff`] policy to a [`Stream`] using [`StreamBackoff`]
    fn backoff<B>(self, b: B) -> StreamBackoff<Self, B>
    where
        B: ResettableBackoff,
        Self: TryStream + Sized,
    {
        StreamBackoff::new(self, b)
    }
}
impl<St: ?Sized> WatchStreamExt for St where St: Stream {}
