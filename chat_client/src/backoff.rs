use std::time::Duration;

/// Reconnection schedule: exponential delay with a capped number of
/// attempts. The delay itself is left uncapped; only the attempt count
/// bounds how long a channel keeps trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base: Duration,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub const DEFAULT_BASE: Duration = Duration::from_secs(3);
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay before reconnect attempt `attempt` (zero-based), or `None`
    /// once the allowed attempts are spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_MAX_ATTEMPTS)
    }
}
