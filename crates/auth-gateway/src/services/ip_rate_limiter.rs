//! Per-IP authentication throttle
//!
//! Sits in front of the per-wallet limiter and bounds how fast any
//! single source can hit the authentication endpoints, plus a global
//! ceiling against distributed floods. In-process only; the per-wallet
//! limiter provides the durable, cross-instance limits.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

/// Default per-IP rate: 20 auth requests per minute
const DEFAULT_PER_IP_RATE: u32 = 20;

/// Default global rate: 1000 auth requests per minute
const DEFAULT_GLOBAL_RATE: u32 = 1000;

/// Throttle rejection
#[derive(Debug, Clone)]
pub struct IpThrottled {
    pub message: String,
    pub retry_after_secs: u64,
}

impl std::fmt::Display for IpThrottled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-IP and global request throttle for the auth endpoints
#[derive(Clone)]
pub struct IpRateLimiter {
    global: Arc<DirectLimiter>,
    per_ip: Arc<Mutex<HashMap<String, Arc<DirectLimiter>>>>,
    per_ip_rate: u32,
}

impl IpRateLimiter {
    pub fn new() -> Self {
        Self::with_rates(DEFAULT_GLOBAL_RATE, DEFAULT_PER_IP_RATE)
    }

    pub fn with_rates(global_rate: u32, per_ip_rate: u32) -> Self {
        let global_quota =
            Quota::per_minute(NonZeroU32::new(global_rate).expect("global rate must be > 0"));

        Self {
            global: Arc::new(GovernorRateLimiter::direct(global_quota)),
            per_ip: Arc::new(Mutex::new(HashMap::new())),
            per_ip_rate,
        }
    }

    /// Check one request from `ip_address` ("unknown" when the source
    /// cannot be determined)
    pub fn check(&self, ip_address: &str) -> Result<(), IpThrottled> {
        if self.global.check().is_err() {
            tracing::warn!(ip = ip_address, "Global auth request ceiling hit");
            return Err(IpThrottled {
                message: "Too many authentication requests. Please try again later.".to_string(),
                retry_after_secs: 1,
            });
        }

        let limiter = self.limiter_for(ip_address);
        if limiter.check().is_err() {
            tracing::warn!(ip = ip_address, "Per-IP auth request limit hit");
            return Err(IpThrottled {
                message: "Too many authentication requests from your address. Please try again later."
                    .to_string(),
                retry_after_secs: 60,
            });
        }

        Ok(())
    }

    fn limiter_for(&self, ip_address: &str) -> Arc<DirectLimiter> {
        let mut limiters = self.per_ip.lock().expect("ip limiter lock poisoned");

        limiters
            .entry(ip_address.to_string())
            .or_insert_with(|| {
                let quota = Quota::per_minute(
                    NonZeroU32::new(self.per_ip_rate).expect("per-IP rate must be > 0"),
                );
                Arc::new(GovernorRateLimiter::direct(quota))
            })
            .clone()
    }

    /// Bound the per-IP map; stale limiters reset naturally once their
    /// quota period passes, this only caps memory.
    pub fn evict_to(&self, max_entries: usize) {
        let mut limiters = self.per_ip.lock().expect("ip limiter lock poisoned");
        if limiters.len() > max_entries {
            let excess = limiters.len() - max_entries;
            let keys: Vec<String> = limiters.keys().take(excess).cloned().collect();
            for key in keys {
                limiters.remove(&key);
            }
            tracing::debug!(removed = excess, "Evicted stale per-IP limiters");
        }
    }
}

impl Default for IpRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
