use std::time::Duration;

/// Exponential backoff policy with a ceiling.
///
/// Shared by the delivery channel (between send retries) and the producer
/// loop (interval stretching under backpressure). Delays double per
/// consecutive failure and saturate at the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    initial: Duration,
    ceiling: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            ceiling: ceiling.max(initial),
        }
    }

    /// Delay before the next attempt after `consecutive_failures` failures.
    ///
    /// Zero failures means no delay; one failure yields the initial delay;
    /// each further failure doubles it up to the ceiling.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        // 2^(n-1), saturating well before Duration overflow
        let exponent = (consecutive_failures - 1).min(32);
        let factor = 2u32.saturating_pow(exponent);
        self.initial.saturating_mul(factor).min(self.ceiling)
    }
}
