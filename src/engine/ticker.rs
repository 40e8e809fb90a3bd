//! Wall-clock minute ticker: fires ten times per block period, yielding the
//! minute index 0..=9, then wraps.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::Stream;
use futures_timer::Delay;

pub struct MinuteTicker {
    delay: Delay,
    tenth: Duration,
    minute: u8,
}

impl MinuteTicker {
    pub fn new(block_period: Duration) -> Self {
        let tenth = block_period / 10;
        Self {
            delay: Delay::new(tenth),
            tenth,
            minute: 0,
        }
    }
}

impl Stream for MinuteTicker {
    type Item = u8;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.delay.poll_unpin(cx) {
            Poll::Ready(_) => {
                let minute = self.minute;
                self.minute = (minute + 1) % 10;
                let tenth = self.tenth;
                self.delay.reset(tenth);
                Poll::Ready(Some(minute))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_minutes_cycle() {
        let mut ticker = MinuteTicker::new(Duration::from_millis(100));
        for expected in [0u8, 1, 2] {
            assert_eq!(ticker.next().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_wraps_after_minute_nine() {
        let mut ticker = MinuteTicker::new(Duration::from_millis(20));
        let minutes: Vec<u8> = ticker.by_ref().take(12).collect().await;
        assert_eq!(minutes[9], 9);
        assert_eq!(minutes[10], 0);
    }
}
