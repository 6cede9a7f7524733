use std::time::Duration;

use backon::{Backoff, BackoffBuilder};

/// A backoff delay sequence that can start over
///
/// Implemented by [`RebuildingBackoff`] for any `backon` builder.
pub trait ResettableBackoff: Backoff {
    /// Start the delay sequence over from the beginning
    fn reset(&mut self);
}

/// A `backon` delay sequence that is rebuilt from its builder on [`reset`](ResettableBackoff::reset)
#[derive(Debug)]
pub struct RebuildingBackoff<B: BackoffBuilder + Clone> {
    builder: B,
    delays: B::Backoff,
}

impl<B: BackoffBuilder + Clone> RebuildingBackoff<B> {
    /// Start the first delay sequence of `builder`
    pub fn new(builder: B) -> Self {
        let delays = builder.clone().build();
        Self { builder, delays }
    }
}

impl<B: BackoffBuilder + Clone + Default> Default for RebuildingBackoff<B> {
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<B: BackoffBuilder + Clone> Iterator for RebuildingBackoff<B> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.delays.next()
    }
}

impl<B: BackoffBuilder + Clone> ResettableBackoff for RebuildingBackoff<B> {
    fn reset(&mut self) {
        self.delays = self.builder.clone().build();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::{ConstantBuilder, ExponentialBuilder};

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = RebuildingBackoff::new(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(40))
                .with_factor(2.0)
                .without_max_times(),
        );
        let first: Vec<_> = backoff.by_ref().take(5).collect();
        assert_eq!(first[0], Duration::from_millis(10));
        assert!(first.windows(2).all(|w| w[0] <= w[1]), "{first:?}");
        // the ceiling is exact, the doublings below it are float-derived
        assert_eq!(first[4], Duration::from_millis(40));
        backoff.reset();
        assert_eq!(backoff.next(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn exhausted_sequences_come_back_after_reset() {
        let mut backoff = RebuildingBackoff::new(ConstantBuilder::default().with_max_times(1));
        assert!(backoff.next().is_some());
        assert_eq!(backoff.next(), None);
        backoff.reset();
        assert!(backoff.next().is_some());
    }
}
