//! Outbound request throttling

use governor::{DefaultDirectRateLimiter, Quota};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

use crate::core::config::DispatcherConfig;

/// Token bucket shared by every outbound command, so retries also consume budget
#[derive(Clone)]
pub struct RequestLimiter {
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl RequestLimiter {
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or_else(|| {
            warn!("Invalid request rate {}, using 1/s", requests_per_second);
            NonZeroU32::MIN
        });
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);
        Self {
            limiter: Arc::new(DefaultDirectRateLimiter::direct(quota)),
        }
    }

    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(config.requests_per_second, config.burst)
    }

    /// Wait for one token
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
