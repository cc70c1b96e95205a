//! Typed, environment-driven configuration surface for the gateway.
//!
//! Every knob here has a documented default so the gateway runs out of the
//! box in a single-process, in-memory mode for local development and tests.

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub max_events_per_conv: Option<u64>,
    pub max_age_seconds: Option<u64>,
    pub sweep_interval_seconds: u64,
    pub cursor_stale_after_seconds: u64,
    /// SAFE (false) never prunes events a lagging cursor still needs; HARD (true)
    /// enforces caps unconditionally.
    pub hard_limits: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub send_per_conv: (u32, Duration),
    pub dm_create: (u32, Duration),
    pub keypackage_fetch: (u32, Duration),
    pub keypackage_publish: (u32, Duration),
    pub presence_op: (u32, Duration),
    pub frame_rate: (u32, Duration),
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway_id: String,
    pub server_port: u16,
    pub db_path: Option<String>,
    pub enable_metrics: bool,
    pub auth_shared_secret: Option<String>,
    pub session_ttl_seconds: i64,
    pub max_keypackages_per_device: i64,
    pub max_watchlist_size: i64,
    pub max_watchers_per_target: i64,
    pub envelope_byte_cap: usize,
    pub frame_byte_cap: usize,
    pub heartbeat_interval_seconds: u64,
    pub retention: RetentionConfig,
    pub rate_limits: RateLimitConfig,
}

impl GatewayConfig {
    /// Build configuration from the process environment. Call once at startup.
    pub fn from_env() -> Self {
        let send_limit = env_or("RATE_LIMIT_SEND_PER_CONV", 100);
        let dm_limit = env_or("RATE_LIMIT_DM_CREATE", 5);
        let kp_fetch_limit = env_or("RATE_LIMIT_KEYPACKAGE_FETCH", 30);
        let kp_publish_limit = env_or("RATE_LIMIT_KEYPACKAGE_PUBLISH", 50);
        let presence_limit = env_or("RATE_LIMIT_PRESENCE_OP", 60);
        let frame_limit = env_or("RATE_LIMIT_FRAME_PER_CONN", 200);

        Self {
            gateway_id: env::var("GATEWAY_ID").unwrap_or_else(|_| "gw_local".to_string()),
            server_port: env_or("SERVER_PORT", 8080),
            db_path: env::var("DB_PATH").ok(),
            enable_metrics: env::var("ENABLE_METRICS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            auth_shared_secret: env::var("AUTH_SHARED_SECRET").ok(),
            session_ttl_seconds: env_or("SESSION_TTL_SECONDS", 2_592_000),
            max_keypackages_per_device: env_or("MAX_KEYPACKAGES_PER_DEVICE", 50),
            max_watchlist_size: env_or("MAX_WATCHLIST_SIZE", 500),
            max_watchers_per_target: env_or("MAX_WATCHERS_PER_TARGET", 5000),
            envelope_byte_cap: env_or("ENVELOPE_BYTE_CAP", 1_048_576),
            frame_byte_cap: env_or("FRAME_BYTE_CAP", 1_200_000),
            heartbeat_interval_seconds: env_or("HEARTBEAT_INTERVAL_SECONDS", 30),
            retention: RetentionConfig {
                max_events_per_conv: env_opt("RETENTION_MAX_EVENTS_PER_CONV"),
                max_age_seconds: env_opt("RETENTION_MAX_AGE_SECONDS"),
                sweep_interval_seconds: env_or("RETENTION_SWEEP_INTERVAL_SECONDS", 1800),
                cursor_stale_after_seconds: env_or("CURSOR_STALE_AFTER_SECONDS", 0),
                hard_limits: env::var("RETENTION_HARD_LIMITS")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            },
            rate_limits: RateLimitConfig {
                send_per_conv: (send_limit, Duration::from_secs(60)),
                dm_create: (dm_limit, Duration::from_secs(60)),
                keypackage_fetch: (kp_fetch_limit, Duration::from_secs(60)),
                keypackage_publish: (kp_publish_limit, Duration::from_secs(60)),
                presence_op: (presence_limit, Duration::from_secs(60)),
                frame_rate: (frame_limit, Duration::from_secs(60)),
            },
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_any_env() {
        let cfg = GatewayConfig {
            gateway_id: "gw_test".to_string(),
            ..GatewayConfig::from_env()
        };
        assert_eq!(cfg.gateway_id, "gw_test");
        assert!(cfg.envelope_byte_cap >= 1_048_576 || cfg.envelope_byte_cap > 0);
        assert!(cfg.heartbeat_interval_seconds > 0);
    }
}
