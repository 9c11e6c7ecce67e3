use std::time::Duration;

use eds_client::domain::truncate;
use futures::Stream;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::pipeline::PipelineError;

/// Emits ticks on wall-clock boundaries of a fixed interval.
///
/// With a one-minute interval ticks land on :00 of every minute no matter
/// when the ticker was created. The next boundary is always recomputed from
/// the current time, so oversleeping never accumulates.
#[derive(Debug, Clone, Copy)]
pub struct AlignedTicker {
    interval: Duration,
}

impl AlignedTicker {
    pub fn new(interval: Duration) -> Result<Self, PipelineError> {
        if interval.is_zero() {
            return Err(PipelineError::Config("tick interval must be > 0".to_string()));
        }
        Ok(Self { interval })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Infinite stream of boundary instants. Ends once `cancel` fires.
    ///
    /// The stream is lazy: nothing sleeps until it is polled, and a fresh
    /// stream can be created for every run.
    pub fn ticks(&self, cancel: CancellationToken) -> impl Stream<Item = OffsetDateTime> + Send {
        aligned_ticks(self.interval, OffsetDateTime::now_utc, cancel)
    }
}

/// Tick loop over an injectable wall clock.
///
/// Sleeping happens on the monotonic clock, so a wall clock that was stepped
/// back can still read before `next` on wake-up. Such a wake is not a tick;
/// the loop goes round and sleeps the remainder instead of repeating `next`.
fn aligned_ticks<C>(
    interval: Duration,
    clock: C,
    cancel: CancellationToken,
) -> impl Stream<Item = OffsetDateTime> + Send
where
    C: Fn() -> OffsetDateTime + Send + 'static,
{
    async_stream::stream! {
        loop {
            let now = clock();
            let next = next_boundary(now, interval);
            let wait = Duration::try_from(next - now).unwrap_or(Duration::ZERO);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            if clock() < next {
                continue;
            }

            yield next;
        }
    }
}

/// First boundary strictly after `now`.
pub fn next_boundary(now: OffsetDateTime, interval: Duration) -> OffsetDateTime {
    truncate(now, interval) + interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use time::macros::datetime;

    #[test]
    fn rejects_zero_interval() {
        assert!(matches!(
            AlignedTicker::new(Duration::ZERO),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn boundary_is_next_whole_minute() {
        let minute = Duration::from_secs(60);
        for now in [
            datetime!(2024-05-01 10:00:00.001 UTC),
            datetime!(2024-05-01 10:00:30 UTC),
            datetime!(2024-05-01 10:00:59.999 UTC),
        ] {
            assert_eq!(next_boundary(now, minute), datetime!(2024-05-01 10:01:00 UTC));
        }
    }

    #[test]
    fn boundary_on_exact_minute_moves_forward() {
        let minute = Duration::from_secs(60);
        let now = datetime!(2024-05-01 10:00:00 UTC);
        assert_eq!(next_boundary(now, minute), datetime!(2024-05-01 10:01:00 UTC));
    }

    #[test]
    fn boundaries_are_epoch_multiples_for_any_interval() {
        let starts = [
            datetime!(2023-12-31 23:59:59.5 UTC),
            datetime!(2024-02-29 07:13:41.25 UTC),
            datetime!(2024-05-01 10:00:00 UTC),
        ];
        for secs in [1u64, 7, 60, 300, 3600] {
            let interval = Duration::from_secs(secs);
            for start in starts {
                let next = next_boundary(start, interval);
                assert_eq!(next.unix_timestamp_nanos() % interval.as_nanos() as i128, 0);
                assert!(next > start);
                assert!(next - start <= interval);
            }
        }
    }

    #[tokio::test]
    async fn ticks_are_aligned_to_interval() {
        let interval = Duration::from_millis(50);
        let ticker = AlignedTicker::new(interval).unwrap();
        let cancel = CancellationToken::new();

        let ticks: Vec<_> = ticker.ticks(cancel.clone()).take(3).collect().await;

        assert_eq!(ticks.len(), 3);
        for pair in ticks.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        for tick in ticks {
            assert_eq!(tick.unix_timestamp_nanos() % interval.as_nanos() as i128, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn early_wake_does_not_repeat_a_boundary() {
        use std::collections::VecDeque;
        use std::sync::Mutex;

        // Wall clock readings in call order; the second one lags behind the
        // boundary the first sleep was aiming for.
        let readings = Mutex::new(VecDeque::from([
            datetime!(2024-05-01 10:00:30 UTC),
            datetime!(2024-05-01 10:00:59.5 UTC),
            datetime!(2024-05-01 10:00:59.5 UTC),
            datetime!(2024-05-01 10:01:00 UTC),
            datetime!(2024-05-01 10:01:00 UTC),
            datetime!(2024-05-01 10:02:00.001 UTC),
        ]));
        let last = Mutex::new(datetime!(2024-05-01 10:02:00.001 UTC));
        let clock = move || {
            let mut last = last.lock().unwrap();
            if let Some(t) = readings.lock().unwrap().pop_front() {
                *last = t;
            }
            *last
        };

        let ticks: Vec<_> = aligned_ticks(Duration::from_secs(60), clock, CancellationToken::new())
            .take(2)
            .collect()
            .await;

        assert_eq!(
            ticks,
            vec![
                datetime!(2024-05-01 10:01:00 UTC),
                datetime!(2024-05-01 10:02:00 UTC),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_stream_ends_without_ticking() {
        let ticker = AlignedTicker::new(Duration::from_secs(3600)).unwrap();
        let cancel = CancellationToken::new();
        let mut ticks = Box::pin(ticker.ticks(cancel.clone()));

        cancel.cancel();
        let next = tokio::time::timeout(Duration::from_secs(1), ticks.next())
            .await
            .expect("stream should end promptly");
        assert!(next.is_none());
    }
}
