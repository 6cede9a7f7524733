use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Stream, TryStream};
use pin_project::pin_project;
use tokio::time::{sleep, Sleep};

use crate::utils::ResettableBackoff;

/// Applies a [`ResettableBackoff`] policy to a [`Stream`]
///
/// Every [`Err`] pauses the stream for the next delay of the backoff before the inner stream
/// is polled again, and every [`Ok`] resets the backoff. Once the backoff runs out of delays the
/// stream ends.
#[pin_project]
pub struct StreamBackoff<S, B> {
    #[pin]
    stream: S,
    backoff: B,
    // boxed so the wrapper stays small while idle
    pause: Option<Pin<Box<Sleep>>>,
    exhausted: bool,
}

impl<S: TryStream, B: ResettableBackoff> StreamBackoff<S, B> {
    /// Wrap `stream`, sleeping according to `backoff` after errors
    pub fn new(stream: S, backoff: B) -> Self {
        Self {
            stream,
            backoff,
            pause: None,
            exhausted: false,
        }
    }
}

impl<S: TryStream, B: ResettableBackoff> Stream for StreamBackoff<S, B> {
    type Item = Result<S::Ok, S::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.exhausted {
            return Poll::Ready(None);
        }
        if let Some(pause) = this.pause.as_mut() {
            if pause.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            tracing::trace!("backoff elapsed, resuming");
            *this.pause = None;
        }

        let item = this.stream.try_poll_next(cx);
        match &item {
            Poll::Ready(Some(Err(_))) => match this.backoff.next() {
                Some(delay) => {
                    tracing::debug!(?delay, "stream failed, backing off");
                    *this.pause = Some(Box::pin(sleep(delay)));
                }
                None => {
                    tracing::debug!("stream failed and backoff is exhausted, closing");
                    *this.exhausted = true;
                }
            },
            Poll::Ready(Some(Ok(_))) => this.backoff.reset(),
            Poll::Ready(None) | Poll::Pending => {}
        }
        item
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{task::Poll, time::Duration};

    use super::StreamBackoff;
    use crate::utils::{RebuildingBackoff, ResettableBackoff};
    use backon::ConstantBuilder;
    use futures::{channel::mpsc, pin_mut, poll, stream, StreamExt};

    /// Delays growing by `step` on every failure, deterministic for tests
    #[derive(Debug)]
    pub struct Steps {
        step: Duration,
        next: Duration,
    }

    impl Steps {
        pub fn new(step: Duration) -> Self {
            Self {
                step,
                next: Duration::ZERO,
            }
        }
    }

    impl Iterator for Steps {
        type Item = Duration;

        fn next(&mut self) -> Option<Duration> {
            self.next += self.step;
            Some(self.next)
        }
    }

    impl ResettableBackoff for Steps {
        fn reset(&mut self) {
            self.next = Duration::ZERO;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_after_failures_only() {
        let delay = Duration::from_secs(1);
        let events = stream::iter([Ok("list"), Err("unavailable"), Ok("watch"), Ok("bookmark")]);
        let events = StreamBackoff::new(
            events,
            RebuildingBackoff::new(ConstantBuilder::default().with_delay(delay).without_max_times()),
        );
        pin_mut!(events);
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Ok("list"))));
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Err("unavailable"))));
        assert_eq!(poll!(events.next()), Poll::Pending);
        tokio::time::advance(delay).await;
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Ok("watch"))));
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Ok("bookmark"))));
        assert_eq!(poll!(events.next()), Poll::Ready(None));
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_failures_grow_the_pause_until_success() {
        let (tx, rx) = mpsc::unbounded::<Result<u32, u32>>();
        let events = StreamBackoff::new(rx, Steps::new(Duration::from_secs(2)));
        pin_mut!(events);

        tx.unbounded_send(Err(1)).unwrap();
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Err(1))));
        tokio::time::advance(Duration::from_secs(2)).await;
        tx.unbounded_send(Err(2)).unwrap();
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Err(2))));

        // second failure pauses for 4s
        tx.unbounded_send(Ok(3)).unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(poll!(events.next()), Poll::Pending);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Ok(3))));

        // success started the sequence over
        tx.unbounded_send(Err(4)).unwrap();
        assert_eq!(poll!(events.next()), Poll::Ready(Some(Err(4))));
        tokio::time::advance(Duration::from_secs(2)).await;
        drop(tx);
        assert_eq!(poll!(events.next()), Poll::Ready(None));
    }

    #[tokio::test]
    async fn exhausted_backoff_closes_the_stream() {
        let events = StreamBackoff::new(
            stream::iter([Ok(0), Err(1), Ok(2)]),
            RebuildingBackoff::new(ConstantBuilder::default().with_max_times(0)),
        );
        assert_eq!(events.collect::<Vec<_>>().await, [Ok(0), Err(1)]);
    }
}
