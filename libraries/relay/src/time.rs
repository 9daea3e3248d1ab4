//! Clock and sleep abstractions.
//!
//! The debounce window and the retry backoff both need a notion of time, but
//! the host decides where time comes from: the real clock in production, a
//! scripted one in tests. Neither trait spawns anything; sleeping is a future
//! the caller awaits.

use std::cell::RefCell;

use chrono::{DateTime, TimeDelta, Utc};
use futures::FutureExt;
use futures::future::LocalBoxFuture;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
pub struct ManualClock {
    now: RefCell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RefCell::new(start),
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.borrow_mut();
        *now = *now + delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }
}

/// Awaitable delay between retry attempts. Boxed so the runner can hold a
/// `dyn Sleeper` without caring who provides the timer.
pub trait Sleeper {
    fn sleep(&self, delay: TimeDelta) -> LocalBoxFuture<'_, ()>;
}

/// Resolves immediately. The default for tests and for hosts whose event loop
/// has no timer to offer; the retry loop still bounds the attempt count.
pub struct NoopSleeper;

impl Sleeper for NoopSleeper {
    fn sleep(&self, _delay: TimeDelta) -> LocalBoxFuture<'_, ()> {
        async {}.boxed_local()
    }
}
