//! Reconnect scheduling: the retry delay table and the countdown timer.
//!
//! The delay table is walked one entry per failed attempt and wraps around at
//! the end, so retries continue forever unless an entry equals
//! [`STOP_SENTINEL`]. The countdown ticks once per second so the client can
//! report "reconnecting in Ns" while it waits.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::types::{Error, Result};

/// Delay table entry meaning "stop reconnecting".
pub const STOP_SENTINEL: i64 = -1;
pub(crate) const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Ordered, non-empty table of retry delays in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectDelays(Vec<i64>);

impl ReconnectDelays {
    pub fn new(delays: Vec<i64>) -> Result<Self> {
        if delays.is_empty() {
            return Err(Error::Config("reconnect delay table is empty".into()));
        }
        if let Some(bad) = delays.iter().find(|&&d| d < STOP_SENTINEL) {
            return Err(Error::Config(format!(
                "invalid reconnect delay {bad}: must be >= 0 or {STOP_SENTINEL}"
            )));
        }
        Ok(Self(delays))
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`; construction rejects empty tables.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        self.0.get(index).copied()
    }
}

/// Outcome of [`ReconnectScheduler::next_delay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextDelay {
    pub index: usize,
    pub delay_ms: i64,
    /// `false` when the entry is the stop sentinel.
    pub should_retry: bool,
}

impl NextDelay {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(u64::try_from(self.delay_ms).unwrap_or(0))
    }
}

/// Owns the delay cursor and at most one running countdown.
pub struct ReconnectScheduler {
    delays: ReconnectDelays,
    index: Option<usize>,
    runtime: Handle,
    countdown: Option<JoinHandle<()>>,
    generation: u64,
}

impl ReconnectScheduler {
    pub fn new(delays: ReconnectDelays, runtime: Handle) -> Self {
        Self {
            delays,
            index: None,
            runtime,
            countdown: None,
            generation: 0,
        }
    }

    pub fn delays(&self) -> &ReconnectDelays {
        &self.delays
    }

    /// Current cursor; `None` until the first failure after a reset.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Advance the cursor (wrapping at the end) and return the delay it lands on.
    pub fn next_delay(&mut self) -> NextDelay {
        let index = match self.index {
            None => 0,
            Some(i) if i + 1 < self.delays.len() => i + 1,
            Some(_) => 0,
        };
        self.index = Some(index);
        let delay_ms = self.delays.get(index).unwrap_or(STOP_SENTINEL);
        NextDelay {
            index,
            delay_ms,
            should_retry: delay_ms != STOP_SENTINEL,
        }
    }

    pub fn reset(&mut self) {
        self.index = None;
    }

    /// Arm a countdown of `total`, cancelling any countdown already running.
    ///
    /// `on_tick` receives the remaining time once per second, including the
    /// final zero. `on_expire` runs exactly once after the last tick and is
    /// handed the generation identifying this countdown, which is also
    /// returned.
    pub fn start_countdown<T, E>(&mut self, total: Duration, mut on_tick: T, on_expire: E) -> u64
    where
        T: FnMut(Duration) + Send + 'static,
        E: FnOnce(u64) + Send + 'static,
    {
        self.stop_countdown();
        let generation = self.generation;
        self.countdown = Some(self.runtime.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
            let mut elapsed = Duration::ZERO;
            loop {
                ticker.tick().await;
                elapsed += TICK_INTERVAL;
                let remaining = total.saturating_sub(elapsed);
                on_tick(remaining);
                if remaining.is_zero() {
                    break;
                }
            }
            on_expire(generation);
        }));
        generation
    }

    /// Cancel the running countdown, if any. Always advances the generation.
    pub fn stop_countdown(&mut self) {
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn is_counting_down(&self) -> bool {
        self.countdown.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn scheduler(delays: Vec<i64>) -> ReconnectScheduler {
        ReconnectScheduler::new(ReconnectDelays::new(delays).unwrap(), Handle::current())
    }

    #[test]
    fn delays_validation() {
        assert!(ReconnectDelays::new(vec![]).is_err());
        assert!(ReconnectDelays::new(vec![1000, -2]).is_err());
        assert!(ReconnectDelays::new(vec![0, -1]).is_ok());
    }

    #[tokio::test]
    async fn next_delay_cycles_without_sentinel() {
        let mut s = scheduler(vec![100, 200, 300]);
        assert_eq!(s.index(), None);
        let seen: Vec<(usize, i64)> = (0..7)
            .map(|_| {
                let next = s.next_delay();
                assert!(next.should_retry);
                (next.index, next.delay_ms)
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                (0, 100),
                (1, 200),
                (2, 300),
                (0, 100),
                (1, 200),
                (2, 300),
                (0, 100)
            ]
        );
    }

    #[tokio::test]
    async fn sentinel_stops_retry() {
        let mut s = scheduler(vec![1000, 2000, -1, 5000]);
        assert!(s.next_delay().should_retry);
        assert!(s.next_delay().should_retry);
        let third = s.next_delay();
        assert_eq!(third.index, 2);
        assert!(!third.should_retry);
        assert_eq!(third.delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn reset_restarts_from_first_entry() {
        let mut s = scheduler(vec![10, 20]);
        s.next_delay();
        s.next_delay();
        assert_eq!(s.index(), Some(1));
        s.reset();
        assert_eq!(s.index(), None);
        assert_eq!(s.next_delay().index, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_ticks_each_second_then_expires_once() {
        let mut s = scheduler(vec![3000]);
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();
        let started = Instant::now();

        let recorded = Arc::clone(&ticks);
        s.start_countdown(
            Duration::from_millis(3000),
            move |remaining| recorded.lock().unwrap().push(remaining),
            move |_| {
                let _ = tx.send(Instant::now());
            },
        );
        assert!(s.is_counting_down());

        let expired_at = rx.await.unwrap();
        assert_eq!(expired_at - started, Duration::from_secs(3));
        assert_eq!(
            *ticks.lock().unwrap(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(1),
                Duration::ZERO
            ]
        );
        tokio::task::yield_now().await;
        assert!(!s.is_counting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_cancels_previous_countdown() {
        let mut s = scheduler(vec![1000]);
        let fired = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&fired);
        let gen_first = s.start_countdown(Duration::from_secs(1), |_| {}, move |generation| {
            first.lock().unwrap().push(("first", generation));
        });
        let second = Arc::clone(&fired);
        let gen_second = s.start_countdown(Duration::from_secs(2), |_| {}, move |generation| {
            second.lock().unwrap().push(("second", generation));
        });
        assert_ne!(gen_first, gen_second);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*fired.lock().unwrap(), vec![("second", gen_second)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_countdown_is_idempotent_and_prevents_expiry() {
        let mut s = scheduler(vec![1000]);
        s.stop_countdown();

        let fired = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&fired);
        let armed = s.start_countdown(Duration::from_secs(2), |_| {}, move |_| {
            *flag.lock().unwrap() = true;
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        s.stop_countdown();
        s.stop_countdown();
        assert!(s.generation() > armed);
        assert!(!s.is_counting_down());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!*fired.lock().unwrap());
    }
}
