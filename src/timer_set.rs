//! Periodic per-key timers.
//!
//! A [`TimerSet`] holds one periodic timer per key and yields keys as their timers fire,
//! re-arming each fired timer for another period. The service keys these by `NodeId` for
//! the keep-alive PING schedule: membership in the set is membership in the connected-peer
//! set.

use futures::Stream;
use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    pin::Pin,
    task::{Context, Poll, Waker},
    time::Duration,
};
use tokio::time::{sleep, Instant, Sleep};

struct PeriodicTimer {
    delay: Pin<Box<Sleep>>,
    period: Duration,
}

pub struct TimerSet<K> {
    timers: HashMap<K, PeriodicTimer>,
    /// Waker to awake the task when a timer is armed.
    waker: Option<Waker>,
}

impl<K: Clone + Eq + Hash> TimerSet<K> {
    pub fn new() -> Self {
        TimerSet {
            timers: HashMap::new(),
            waker: None,
        }
    }

    /// Arms a periodic timer for `key`, firing every `period` from now. An existing timer
    /// under the same key is replaced.
    pub fn arm(&mut self, key: K, period: Duration) {
        self.timers.insert(
            key,
            PeriodicTimer {
                delay: Box::pin(sleep(period)),
                period,
            },
        );
        if let Some(waker) = &self.waker {
            waker.wake_by_ref();
        }
    }

    /// Cancels the timer for `key`. Returns `true` if a timer existed.
    pub fn cancel(&mut self, key: &K) -> bool {
        self.timers.remove(key).is_some()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.timers.keys()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Cancels all timers.
    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

impl<K: Clone + Eq + Hash> Default for TimerSet<K> {
    fn default() -> Self {
        TimerSet::new()
    }
}

impl<K: Clone + Eq + Hash + Unpin> Stream for TimerSet<K> {
    type Item = K;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let s = self.get_mut();
        if let Some(waker) = &s.waker {
            if !waker.will_wake(cx.waker()) {
                s.waker = Some(cx.waker().clone());
            }
        } else {
            s.waker = Some(cx.waker().clone());
        }

        let mut fired = None;
        for (key, timer) in s.timers.iter_mut() {
            if timer.delay.as_mut().poll(cx).is_ready() {
                timer.delay.as_mut().reset(Instant::now() + timer.period);
                // poll again so the new deadline is registered with the driver
                let _ = timer.delay.as_mut().poll(cx);
                fired = Some(key.clone());
                break;
            }
        }

        match fired {
            Some(key) => Poll::Ready(Some(key)),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::time::timeout;

    #[tokio::test]
    async fn armed_timer_fires_periodically() {
        let mut timers: TimerSet<u8> = TimerSet::new();
        timers.arm(1, Duration::from_millis(10));

        let first = timeout(Duration::from_secs(1), timers.next()).await;
        assert_eq!(first.expect("should fire"), Some(1));
        // fires again after re-arming
        let second = timeout(Duration::from_secs(1), timers.next()).await;
        assert_eq!(second.expect("should re-fire"), Some(1));
    }

    #[tokio::test]
    async fn cancelled_timer_does_not_fire() {
        let mut timers: TimerSet<u8> = TimerSet::new();
        timers.arm(1, Duration::from_millis(10));
        assert!(timers.cancel(&1));
        assert!(timers.is_empty());

        let fired = timeout(Duration::from_millis(50), timers.next()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn rearming_replaces_the_timer() {
        let mut timers: TimerSet<u8> = TimerSet::new();
        timers.arm(1, Duration::from_secs(600));
        timers.arm(1, Duration::from_millis(10));
        assert_eq!(timers.len(), 1);

        let fired = timeout(Duration::from_secs(1), timers.next()).await;
        assert_eq!(fired.expect("should fire"), Some(1));
    }
}
