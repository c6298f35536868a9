use std::time::{Duration, Instant};

/// Exponential backoff between attempts, honouring server-provided delays.
#[derive(Debug, Clone)]
pub struct AdaptiveRetryPolicy {
    min_delay: Duration,
    max_delay: Duration,
    backoff: f64,
    max_retries: u32,
    delay: Duration,
    retries: u32,
    retry_at: Option<Instant>,
    should_retry: bool,
}

impl AdaptiveRetryPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration, backoff: f64, max_retries: u32) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            backoff: backoff.max(1.0),
            max_retries,
            delay: min_delay,
            retries: 0,
            retry_at: None,
            should_retry: true,
        }
    }

    pub fn reset(&mut self) {
        self.delay = self.min_delay;
        self.retries = 0;
        self.retry_at = None;
        self.should_retry = true;
    }

    pub fn on_success(&mut self) {
        self.reset();
    }

    /// Record a failed attempt. `retry_after` comes from the server, when it said anything.
    pub fn on_failure(&mut self, retry_after: Option<Duration>) {
        if let Some(retry_after) = retry_after {
            self.delay = retry_after;
        } else if self.retries > 0 {
            self.delay = self
                .delay
                .mul_f64(self.backoff)
                .clamp(self.min_delay, self.max_delay);
        }

        if self.retries >= self.max_retries {
            self.should_retry = false;
        }
        self.retries += 1;
        self.retry_at = Some(Instant::now() + self.delay);
    }

    /// Whether another attempt is allowed at all.
    pub fn should_retry(&self) -> bool {
        self.should_retry
    }

    /// Time left before the next attempt may start.
    pub fn wait_time(&self) -> Duration {
        self.retry_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}
