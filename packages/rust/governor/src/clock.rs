//! Time sources for the governor and the orchestrator.
//!
//! Everything that waits or measures elapsed time goes through [`Clock`] so
//! tests can run on virtual time with [`ManualClock`].

use std::fmt::Debug;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

#[async_trait]
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);

    /// Resolve once `now()` reaches `deadline`.
    async fn sleep_until(&self, deadline: Instant);
}

/// Wall clock backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}

/// Virtual clock. Time only moves through [`ManualClock::advance`] or
/// [`Clock::sleep`], which advances instantly. [`Clock::sleep_until`] parks
/// until some other task moves time past the deadline.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: watch::Sender<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: watch::Sender::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.send_modify(|offset| *offset += by);
    }

    /// Virtual time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        *self.offset.borrow()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    async fn sleep_until(&self, deadline: Instant) {
        let mut changes = self.offset.subscribe();
        while self.now() < deadline {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}
