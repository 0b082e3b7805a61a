//! Backoff between same-phase retries, as a pure function of the attempt.

use std::time::Duration;

use enricher_shared::PipelineConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    schedule: Vec<Duration>,
    cap: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(schedule: Vec<Duration>, cap: Duration, max_attempts: u32) -> Self {
        Self {
            schedule,
            cap,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay after attempt number `attempt` (1-based) failed.
    ///
    /// Attempts past the end of the schedule reuse its last step. Every delay
    /// is capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) - 1) as usize;
        let step = self
            .schedule
            .get(index)
            .or_else(|| self.schedule.last())
            .copied()
            .unwrap_or(self.cap);
        step.min(self.cap)
    }
}

impl From<&PipelineConfig> for RetryPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self::new(
            config.backoff_schedule.clone(),
            config.backoff_cap,
            config.max_phase_attempts,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}
