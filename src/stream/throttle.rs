//! Rate limiting for frame streams

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// Adds [`throttle`](ThrottleExt::throttle) to any stream.
pub trait ThrottleExt: Stream {
    /// Emit at most once per `period`.
    ///
    /// Latest wins: items arriving within one period replace each other and
    /// only the newest is emitted. An idle source does not end the stream.
    fn throttle(self, period: Duration) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, period)
    }
}

impl<T: Stream> ThrottleExt for T {}

pin_project! {
    pub struct Throttle<S: Stream> {
        #[pin]
        stream: S,
        interval: Interval,
        pending: Option<S::Item>,
        // A tick was consumed and no item has been emitted for it yet.
        armed: bool,
        done: bool,
    }
}

impl<S: Stream> Throttle<S> {
    pub fn new(stream: S, period: Duration) -> Self {
        let mut interval = interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { stream, interval, pending: None, armed: false, done: false }
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        if !*this.armed {
            ready!(this.interval.poll_tick(cx));
            *this.armed = true;
        }

        loop {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => *this.pending = Some(item),
                Poll::Ready(None) => {
                    *this.done = true;
                    *this.armed = false;
                    return Poll::Ready(this.pending.take());
                }
                Poll::Pending => {
                    return match this.pending.take() {
                        Some(item) => {
                            *this.armed = false;
                            Poll::Ready(Some(item))
                        }
                        None => Poll::Pending,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::stream;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_latest() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut throttled = UnboundedReceiverStream::new(rx).throttle(Duration::from_millis(100));

        tx.send(1).unwrap();
        assert_eq!(throttled.next().await, Some(1));

        for n in 2..=5 {
            tx.send(n).unwrap();
        }
        assert_eq!(throttled.next().await, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_source_keeps_stream_open() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut throttled = UnboundedReceiverStream::new(rx).throttle(Duration::from_millis(10));

        let waited = tokio::time::timeout(Duration::from_millis(50), throttled.next()).await;
        assert!(waited.is_err());

        tx.send(7).unwrap();
        assert_eq!(throttled.next().await, Some(7));

        drop(tx);
        assert_eq!(throttled.next().await, None);
        assert_eq!(throttled.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_items_drain_on_first_tick() {
        let mut throttled = stream::iter(0..3).chain(stream::pending()).throttle(Duration::from_millis(50));
        assert_eq!(throttled.next().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn emissions_are_spaced_by_the_period() {
        let period = Duration::from_millis(50);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut throttled = UnboundedReceiverStream::new(rx).throttle(period);
        let start = tokio::time::Instant::now();

        tx.send(1).unwrap();
        assert_eq!(throttled.next().await, Some(1));
        tx.send(2).unwrap();
        assert_eq!(throttled.next().await, Some(2));
        assert!(start.elapsed() >= period);
    }
}
