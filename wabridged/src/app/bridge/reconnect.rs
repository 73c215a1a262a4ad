use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(300_000);
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 12;

/// Capped exponential backoff with additive jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
    /// Zero means unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before jitter for the 1-based `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay.max(self.base_delay))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt > self.max_attempts
    }

    /// Full wait for `attempt`, or `None` once the attempt budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.is_exhausted(attempt) {
            return None;
        }
        let delay = self.backoff(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        Some(delay + delay.mul_f64(ratio * fastrand::f64()))
    }
}

#[derive(Default)]
struct Slot {
    ticket: u64,
    handle: Option<JoinHandle<()>>,
}

/// Holds at most one pending rebootstrap timer.
#[derive(Default)]
pub struct ReconnectScheduler {
    slot: Mutex<Slot>,
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arms a timer that calls `fire` with its ticket after `delay`, replacing any pending one.
    pub fn schedule<F>(&self, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let mut slot = self.slot();
        slot.ticket += 1;
        let ticket = slot.ticket;
        if let Some(previous) = slot.handle.take() {
            previous.abort();
        }
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(ticket);
        }));
        ticket
    }

    /// Consumes the pending timer if `ticket` is still the current one.
    pub fn claim(&self, ticket: u64) -> bool {
        let mut slot = self.slot();
        if slot.ticket == ticket && slot.handle.is_some() {
            slot.handle = None;
            return true;
        }
        false
    }

    pub fn is_pending(&self) -> bool {
        self.slot().handle.is_some()
    }

    pub fn cancel(&self) {
        let mut slot = self.slot();
        slot.ticket += 1;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
