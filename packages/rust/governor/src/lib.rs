//! Process-wide rate governor.
//!
//! Every outbound call obtains a permit for its origin and for the global
//! budget before it is made. [`RateGovernor::acquire`] never blocks: it either
//! grants both permits atomically or reports how long to wait. A call is
//! granted only when both buckets have a token; when the origin token is taken
//! but the global bucket is empty, the origin token is refunded.
//!
//! With the default burst of 1, permits for a key are spaced at least
//! `1 / rps` apart, so no one-second window sees more than `rps` permits.
//! Larger bursts trade that property for throughput after idle periods.
//!
//! The origin table is bounded by `max_tracked_origins`. Least-recently-used
//! buckets are evicted at the cap and idle buckets are swept periodically. An
//! evicted origin starts over with a full bucket, so eviction under cap
//! pressure can admit one extra permit for that origin.

mod bucket;
pub mod clock;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use enricher_shared::{GovernorConfig, RateLimitKey};

use crate::bucket::TokenBucket;
pub use crate::clock::{Clock, ManualClock, SystemClock};

/// Outcome of a non-blocking permit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Permit,
    /// Retry after this long. Never negative; zero is not returned.
    Wait(Duration),
}

#[derive(Debug)]
struct OriginTable {
    buckets: HashMap<String, TokenBucket>,
    last_sweep: Instant,
}

/// Shared, thread-safe rate governor. Clone the surrounding `Arc` to share.
#[derive(Debug)]
pub struct RateGovernor {
    config: GovernorConfig,
    clock: Arc<dyn Clock>,
    origins: Mutex<OriginTable>,
    global: Mutex<TokenBucket>,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let global = TokenBucket::new(config.global_rps, config.global_burst, now);
        Self {
            config,
            clock,
            origins: Mutex::new(OriginTable {
                buckets: HashMap::new(),
                last_sweep: now,
            }),
            global: Mutex::new(global),
        }
    }

    /// Governor on the wall clock.
    pub fn with_system_clock(config: GovernorConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Request a permit for `key`.
    ///
    /// [`RateLimitKey::Global`] draws on the global budget only.
    pub fn acquire(&self, key: &RateLimitKey) -> Acquire {
        let now = self.clock.now();
        match key {
            RateLimitKey::Global => {
                let mut global = self.global.lock().unwrap_or_else(PoisonError::into_inner);
                match global.try_take(now) {
                    Ok(()) => Acquire::Permit,
                    Err(wait) => Acquire::Wait(non_zero(wait)),
                }
            }
            RateLimitKey::Origin(origin) => self.acquire_origin(origin, now),
        }
    }

    fn acquire_origin(&self, origin: &str, now: Instant) -> Acquire {
        // Lock order: origins, then global.
        let mut table = self.origins.lock().unwrap_or_else(PoisonError::into_inner);
        self.sweep_idle(&mut table, now);

        if !table.buckets.contains_key(origin) {
            if table.buckets.len() >= self.config.max_tracked_origins {
                evict_lru(&mut table);
            }
            table.buckets.insert(
                origin.to_string(),
                TokenBucket::new(self.config.origin_rps, self.config.origin_burst, now),
            );
        }
        let Some(bucket) = table.buckets.get_mut(origin) else {
            return Acquire::Wait(non_zero(Duration::ZERO));
        };

        let mut global = self.global.lock().unwrap_or_else(PoisonError::into_inner);
        match bucket.try_take(now) {
            Err(origin_wait) => {
                let global_wait = global.peek_wait(now);
                Acquire::Wait(non_zero(origin_wait.max(global_wait)))
            }
            Ok(()) => match global.try_take(now) {
                Ok(()) => Acquire::Permit,
                Err(global_wait) => {
                    bucket.refund();
                    debug!(origin, wait_ms = global_wait.as_millis() as u64, "global budget exhausted");
                    Acquire::Wait(non_zero(global_wait))
                }
            },
        }
    }

    /// Acquire a permit, sleeping on the governor's clock between attempts.
    ///
    /// Gives up with `Err(wait)` once the next sleep would push the total
    /// wait past `max_wait`.
    pub async fn acquire_within(
        &self,
        key: &RateLimitKey,
        max_wait: Duration,
    ) -> Result<(), Duration> {
        let mut waited = Duration::ZERO;
        loop {
            match self.acquire(key) {
                Acquire::Permit => return Ok(()),
                Acquire::Wait(wait) => {
                    if waited.saturating_add(wait) > max_wait {
                        return Err(wait);
                    }
                    self.clock.sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }

    /// Number of origins currently tracked.
    pub fn tracked_origins(&self) -> usize {
        self.origins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buckets
            .len()
    }

    fn sweep_idle(&self, table: &mut OriginTable, now: Instant) {
        let idle = self.config.origin_idle;
        if now.saturating_duration_since(table.last_sweep) < idle {
            return;
        }
        let before = table.buckets.len();
        table
            .buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_used()) < idle);
        table.last_sweep = now;
        let swept = before - table.buckets.len();
        if swept > 0 {
            debug!(swept, remaining = table.buckets.len(), "swept idle origin buckets");
        }
    }
}

fn evict_lru(table: &mut OriginTable) {
    let oldest = table
        .buckets
        .iter()
        .min_by_key(|(_, bucket)| bucket.last_used())
        .map(|(origin, _)| origin.clone());
    if let Some(origin) = oldest {
        table.buckets.remove(&origin);
        debug!(origin = %origin, "evicted least recently used origin bucket");
    }
}

/// Waits are reported as at least one millisecond so callers always make progress.
fn non_zero(wait: Duration) -> Duration {
    wait.max(Duration::from_millis(1))
}
