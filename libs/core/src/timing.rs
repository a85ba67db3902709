use std::time::Duration;

/// Exponential backoff used by the readiness poller.
///
/// Attempt `n` waits `base * 2^n`, capped at `cap`; after `max_retries`
/// waits the poller gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Backoff {
    /// Delay before re-evaluating after attempt `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Worst-case time spent waiting before giving up.
    pub fn budget(&self) -> Duration {
        (0..self.max_retries).map(|attempt| self.delay(attempt)).sum()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(3200),
            max_retries: 5,
        }
    }
}

/// Protocol timing knobs. `Default` carries the protocol constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// How long a request/reply exchange waits for its reply
    pub reply_timeout: Duration,
    /// Readiness poll schedule for awaiting a service or a bound channel
    pub backoff: Backoff,
    /// How many times a method call is retried with a fresh id on conflict
    pub max_id_retries: u32,
    /// Local adapter retry interval while no broker is available
    pub local_retry: Duration,
    /// Socket adapter retry delay after a rejected or failed identification
    pub identify_retry: Duration,
    /// Socket adapter delay between failed connection attempts
    pub reconnect_delay: Duration,
    /// Socket connect timeout
    pub connect_timeout: Option<Duration>,
}

impl Timing {
    /// Caller-side bound on a method call: long enough for the broker to
    /// exhaust its own service lookup and reply timeout first.
    pub fn call_timeout(&self) -> Duration {
        self.reply_timeout + self.backoff.budget()
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(2500),
            backoff: Backoff::default(),
            max_id_retries: 5,
            local_retry: Duration::from_millis(2000),
            identify_retry: Duration::from_millis(5000),
            reconnect_delay: Duration::from_millis(1000),
            connect_timeout: Some(Duration::from_millis(2500)),
        }
    }
}
