//! Per-client-IP request rate limiting.
//!
//! Keyed limiter state lives in a concurrent map and is swept
//! periodically so the key set cannot grow without bound under churn.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{clock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use rand::Rng;
use tokio::time::Duration;

// See: https://docs.rs/governor/latest/governor/_guide/index.html#usage-in-multiple-threads
#[derive(Clone)]
pub struct RequestRateLimiter {
    limiter: Arc<RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, clock::DefaultClock>>,
}

impl RequestRateLimiter {
    pub fn new(per_second: NonZeroU32) -> Self {
        let quota = Quota::per_second(per_second);
        RequestRateLimiter {
            limiter: Arc::new(RateLimiter::dashmap(quota)),
        }
    }

    /// Returns true when the request from `ip` is within its budget.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }

    /// Sweeps idle keys once a minute, jittered so replicas do not all
    /// lock their maps at the same instant. Spawned as its own task.
    pub async fn clean_state(&self) {
        loop {
            let jitter = rand::thread_rng().gen_range(0..6);
            tokio::time::sleep(Duration::from_secs(60 + jitter)).await;
            self.limiter.retain_recent();
            self.limiter.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_a_single_key_at_quota() {
        let limiter = RequestRateLimiter::new(NonZeroU32::new(2).unwrap());
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn keys_are_limited_independently() {
        let limiter = RequestRateLimiter::new(NonZeroU32::new(1).unwrap());
        let a: IpAddr = "203.0.113.7".parse().unwrap();
        let b: IpAddr = "203.0.113.8".parse().unwrap();
        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }
}
