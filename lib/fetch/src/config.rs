use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::retry::AdaptiveRetryPolicy;

/// Longest retry delay, whatever the configuration says.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Settings of the fetch pipeline.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct FetchConfig {
    /// Fetch over HTTP when a request has a URL.
    #[serde(default = "default_http_enabled")]
    pub http_enabled: bool,
    /// In-flight HTTP requests above which new ones wait.
    #[serde(default = "default_http_high_water")]
    #[validate(range(min = 1, max = 1024))]
    pub http_high_water: usize,
    /// Waiting requests are released once in-flight requests drop to this level.
    #[serde(default = "default_http_low_water")]
    #[validate(range(min = 1, max = 1024))]
    pub http_low_water: usize,
    /// The HTTP service pipelines, so more requests can be kept in flight.
    #[serde(default)]
    pub http_pipelining: bool,
    #[serde(default = "default_http_timeout_secs")]
    #[validate(range(min = 1))]
    pub http_timeout_secs: u64,
    /// Requests whose range would end past this many bytes ask for the rest of the asset.
    #[serde(default = "default_range_cap_bytes")]
    #[validate(range(min = 1024))]
    pub range_cap_bytes: usize,
    #[serde(default = "default_simulator_flush_interval_ms")]
    #[validate(range(min = 1))]
    pub simulator_flush_interval_ms: u64,
    /// Unchanged simulator requests are re-sent after this long.
    #[serde(default = "default_lazy_flush_secs")]
    pub lazy_flush_secs: u64,
    #[serde(default = "default_max_images_per_message")]
    #[validate(range(min = 1, max = 255))]
    pub max_images_per_message: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_min_secs")]
    #[validate(range(min = 0.0, max = 3600.0))]
    pub retry_min_secs: f64,
    /// Longest delay between retries, raised to `retry_min_secs` when below it.
    #[serde(default = "default_retry_max_secs")]
    #[validate(range(min = 0.0, max = 3600.0))]
    pub retry_max_secs: f64,
    #[serde(default = "default_retry_backoff")]
    #[validate(range(min = 1.0))]
    pub retry_backoff: f64,
    /// Threads decoding fetched data.
    #[serde(default = "default_decode_threads")]
    #[validate(range(min = 1, max = 64))]
    pub decode_threads: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            http_enabled: default_http_enabled(),
            http_high_water: default_http_high_water(),
            http_low_water: default_http_low_water(),
            http_pipelining: false,
            http_timeout_secs: default_http_timeout_secs(),
            range_cap_bytes: default_range_cap_bytes(),
            simulator_flush_interval_ms: default_simulator_flush_interval_ms(),
            lazy_flush_secs: default_lazy_flush_secs(),
            max_images_per_message: default_max_images_per_message(),
            max_retries: default_max_retries(),
            retry_min_secs: default_retry_min_secs(),
            retry_max_secs: default_retry_max_secs(),
            retry_backoff: default_retry_backoff(),
            decode_threads: default_decode_threads(),
        }
    }
}

impl FetchConfig {
    /// High and low water marks of in-flight HTTP requests.
    pub fn http_water_marks(&self) -> (usize, usize) {
        let scale = if self.http_pipelining { 4 } else { 1 };
        let high = self.http_high_water * scale;
        let low = (self.http_low_water * scale).min(high);
        (high, low)
    }

    pub fn retry_policy(&self) -> AdaptiveRetryPolicy {
        AdaptiveRetryPolicy::new(
            retry_delay(self.retry_min_secs),
            retry_delay(self.retry_max_secs),
            self.retry_backoff,
            self.max_retries,
        )
    }

    pub fn simulator_flush_interval(&self) -> Duration {
        Duration::from_millis(self.simulator_flush_interval_ms)
    }

    pub fn lazy_flush_interval(&self) -> Duration {
        Duration::from_secs(self.lazy_flush_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Delay of `secs` seconds, clamped to `0..=MAX_RETRY_DELAY`.
fn retry_delay(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).map_or(
        if secs > 0.0 { MAX_RETRY_DELAY } else { Duration::ZERO },
        |delay| delay.min(MAX_RETRY_DELAY),
    )
}

const fn default_http_enabled() -> bool {
    true
}

const fn default_http_high_water() -> usize {
    64
}

const fn default_http_low_water() -> usize {
    32
}

const fn default_http_timeout_secs() -> u64 {
    60
}

const fn default_range_cap_bytes() -> usize {
    20_000_000
}

const fn default_simulator_flush_interval_ms() -> u64 {
    100
}

const fn default_lazy_flush_secs() -> u64 {
    10
}

const fn default_max_images_per_message() -> usize {
    50
}

const fn default_max_retries() -> u32 {
    10
}

const fn default_retry_min_secs() -> f64 {
    10.0
}

const fn default_retry_max_secs() -> f64 {
    3600.0
}

const fn default_retry_backoff() -> f64 {
    2.0
}

const fn default_decode_threads() -> usize {
    1
}
