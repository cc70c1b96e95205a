//! Token-bucket rate limiting for the gateway's per-operation quotas
//! (`send_per_conv`, `dm_create`, `keypackage_fetch`, `keypackage_publish`,
//! `presence_op`, `frame_rate`).

use axum::http::HeaderMap;
use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::config::RateLimitConfig;

/// Token bucket rate limiter.
#[derive(Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }

    pub fn retry_after_secs(&self) -> u64 {
        if self.tokens >= 1.0 {
            0
        } else {
            let needed = 1.0 - self.tokens;
            (needed / self.refill_rate).ceil() as u64
        }
    }
}

/// A keyed collection of token buckets sharing one capacity/refill rate.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    capacity: u32,
    refill_rate: f64,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            buckets: Arc::new(DashMap::new()),
            capacity,
            refill_rate,
        }
    }

    pub fn check(&self, key: &str) -> Result<(), u64> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_rate));

        if bucket.try_consume() {
            Ok(())
        } else {
            Err(bucket.retry_after_secs())
        }
    }

    pub async fn cleanup_old_buckets(&self, max_age: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < max_age);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        let per_minute = std::env::var("RATE_LIMIT_IP_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(60);
        let burst = per_minute.max(10) / 10;
        Self::new(burst, per_minute as f64 / 60.0)
    }
}

/// One [`RateLimiter`] per operation class named in the configuration
/// surface's `RATE_LIMIT_*` knobs, keyed within each class by device or user
/// id so quotas never leak across identities.
#[derive(Clone)]
pub struct OperationLimiter {
    send_per_conv: RateLimiter,
    dm_create: RateLimiter,
    keypackage_fetch: RateLimiter,
    keypackage_publish: RateLimiter,
    presence_op: RateLimiter,
    frame_rate: RateLimiter,
    /// Keyed by client IP rather than identity, since it guards routes
    /// reachable before any device/session exists (`session.start`).
    ip_backstop: RateLimiter,
}

impl OperationLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            send_per_conv: rate_limiter_from(config.send_per_conv),
            dm_create: rate_limiter_from(config.dm_create),
            keypackage_fetch: rate_limiter_from(config.keypackage_fetch),
            keypackage_publish: rate_limiter_from(config.keypackage_publish),
            presence_op: rate_limiter_from(config.presence_op),
            frame_rate: rate_limiter_from(config.frame_rate),
            ip_backstop: RateLimiter::default(),
        }
    }

    pub fn check_send(&self, conv_id: &str, device_id: &str) -> Result<(), u64> {
        self.send_per_conv.check(&format!("{conv_id}:{device_id}"))
    }

    pub fn check_dm_create(&self, user_id: &str) -> Result<(), u64> {
        self.dm_create.check(user_id)
    }

    pub fn check_keypackage_fetch(&self, user_id: &str) -> Result<(), u64> {
        self.keypackage_fetch.check(user_id)
    }

    pub fn check_keypackage_publish(&self, device_id: &str) -> Result<(), u64> {
        self.keypackage_publish.check(device_id)
    }

    pub fn check_presence_op(&self, device_id: &str) -> Result<(), u64> {
        self.presence_op.check(device_id)
    }

    /// General per-connection frame rate, independent of frame type. Applied
    /// once per inbound WS frame to bound abusive clients regardless of
    /// which op-specific quota a given frame would also consume.
    pub fn check_frame_rate(&self, connection_id: &str) -> Result<(), u64> {
        self.frame_rate.check(connection_id)
    }

    /// Backstop for routes reachable before any device/session identity
    /// exists (currently only `session.start`), keyed by client IP since
    /// there is no device/user id yet to key on.
    pub fn check_unauthenticated_ip(&self, client_ip: &str) -> Result<(), u64> {
        self.ip_backstop.check(client_ip)
    }

    pub async fn cleanup_old_buckets(&self, max_age: Duration) {
        self.send_per_conv.cleanup_old_buckets(max_age).await;
        self.dm_create.cleanup_old_buckets(max_age).await;
        self.keypackage_fetch.cleanup_old_buckets(max_age).await;
        self.keypackage_publish.cleanup_old_buckets(max_age).await;
        self.presence_op.cleanup_old_buckets(max_age).await;
        self.frame_rate.cleanup_old_buckets(max_age).await;
        self.ip_backstop.cleanup_old_buckets(max_age).await;
    }
}

fn rate_limiter_from((burst, window): (u32, Duration)) -> RateLimiter {
    RateLimiter::new(burst, burst as f64 / window.as_secs_f64())
}

/// Best-effort client IP, fed into [`OperationLimiter::check_unauthenticated_ip`]
/// for the unauthenticated-path backstop (e.g. `session.start` before a
/// device identity exists).
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(ip) = xff.split(',').next().map(|s| s.trim().to_string()) {
            if !ip.is_empty() {
                return ip;
            }
        }
    }
    if let Some(ip) = headers
        .get("cf-connecting-ip")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|h| h.to_str().ok())
    {
        return ip.to_string();
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_exhausts_at_capacity() {
        let mut bucket = TokenBucket::new(10, 5.0);
        for _ in 0..10 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(10, 10.0);
        for _ in 0..10 {
            bucket.try_consume();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(bucket.try_consume());
    }

    #[test]
    fn rate_limiter_buckets_are_independent_per_key() {
        let limiter = RateLimiter::new(5, 1.0);
        for _ in 0..5 {
            assert!(limiter.check("user1").is_ok());
        }
        assert!(limiter.check("user1").is_err());
        assert!(limiter.check("user2").is_ok());
    }

    #[test]
    fn operation_limiter_enforces_send_quota_per_conv_and_device() {
        let config = RateLimitConfig {
            send_per_conv: (2, Duration::from_secs(60)),
            dm_create: (5, Duration::from_secs(60)),
            keypackage_fetch: (5, Duration::from_secs(60)),
            keypackage_publish: (5, Duration::from_secs(60)),
            presence_op: (5, Duration::from_secs(60)),
            frame_rate: (5, Duration::from_secs(1)),
        };
        let limiter = OperationLimiter::new(&config);

        assert!(limiter.check_send("conv1", "dev1").is_ok());
        assert!(limiter.check_send("conv1", "dev1").is_ok());
        assert!(limiter.check_send("conv1", "dev1").is_err());
        // A different device in the same conversation gets its own bucket.
        assert!(limiter.check_send("conv1", "dev2").is_ok());
    }

    #[test]
    fn unauthenticated_ip_backstop_is_independent_per_client_ip() {
        let config = RateLimitConfig {
            send_per_conv: (5, Duration::from_secs(60)),
            dm_create: (5, Duration::from_secs(60)),
            keypackage_fetch: (5, Duration::from_secs(60)),
            keypackage_publish: (5, Duration::from_secs(60)),
            presence_op: (5, Duration::from_secs(60)),
            frame_rate: (5, Duration::from_secs(1)),
        };
        let limiter = OperationLimiter::new(&config);

        for _ in 0..10 {
            let _ = limiter.check_unauthenticated_ip("1.2.3.4");
        }
        assert!(
            limiter.check_unauthenticated_ip("1.2.3.4").is_err(),
            "a single IP hammering session.start must eventually be throttled"
        );
        assert!(limiter.check_unauthenticated_ip("5.6.7.8").is_ok());
    }
}
