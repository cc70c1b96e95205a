//! Presence service: TTL leases, mutual-watch enforcement, and coarse
//! `last_seen_bucket` fan-out to watchers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::db::{self, DbPool};
use crate::error::GatewayError;
use crate::models::PresenceLease;

const LEASE_TTL_MIN: i64 = 15;
const LEASE_TTL_MAX: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LastSeenBucket {
    Now,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "7d")]
    SevenDays,
}

impl LastSeenBucket {
    /// Buckets the time since `last_active` into one of the five coarse
    /// windows the spec allows; never exposes a precise timestamp.
    pub fn from_elapsed(last_active: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let elapsed = now.signed_duration_since(last_active);
        if elapsed <= ChronoDuration::seconds(30) {
            LastSeenBucket::Now
        } else if elapsed <= ChronoDuration::minutes(5) {
            LastSeenBucket::FiveMinutes
        } else if elapsed <= ChronoDuration::hours(1) {
            LastSeenBucket::OneHour
        } else if elapsed <= ChronoDuration::days(1) {
            LastSeenBucket::OneDay
        } else {
            LastSeenBucket::SevenDays
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceUpdate {
    pub user_id: String,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub last_seen_bucket: LastSeenBucket,
}

/// Broadcast channel per target `user_id`, mirroring the ancestor's
/// channel-per-conversation SSE state but keyed by the presence target
/// instead of a conversation.
pub struct PresenceHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<PresenceUpdate>>>>,
    buffer_size: usize,
}

impl PresenceHub {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            buffer_size,
        }
    }

    pub async fn subscribe(&self, target_user_id: &str) -> broadcast::Receiver<PresenceUpdate> {
        self.get_channel(target_user_id).await.subscribe()
    }

    async fn get_channel(&self, target_user_id: &str) -> broadcast::Sender<PresenceUpdate> {
        let mut channels = self.channels.write().await;
        channels
            .entry(target_user_id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone()
    }

    async fn emit(&self, target_user_id: &str, update: PresenceUpdate) {
        let tx = self.get_channel(target_user_id).await;
        // No receivers is normal (nobody watching yet).
        let _ = tx.send(update);
    }
}

pub struct PresenceService {
    pool: DbPool,
    hub: Arc<PresenceHub>,
    max_watchlist_size: i64,
    max_watchers_per_target: i64,
}

impl PresenceService {
    pub fn new(
        pool: DbPool,
        hub: Arc<PresenceHub>,
        max_watchlist_size: i64,
        max_watchers_per_target: i64,
    ) -> Self {
        Self {
            pool,
            hub,
            max_watchlist_size,
            max_watchers_per_target,
        }
    }

    /// Clamps `ttl_seconds` into `[15, 300]` per the data model invariant.
    pub async fn lease(
        &self,
        device_id: &str,
        user_id: &str,
        status: &str,
        ttl_seconds: i64,
        invisible: bool,
    ) -> Result<PresenceLease, GatewayError> {
        let ttl = ttl_seconds.clamp(LEASE_TTL_MIN, LEASE_TTL_MAX);
        let expires_at = Utc::now() + ChronoDuration::seconds(ttl);

        db::upsert_presence_lease(&self.pool, device_id, user_id, status, expires_at, invisible)
            .await?;

        self.emit_update(user_id, status, expires_at, invisible)
            .await?;

        Ok(PresenceLease {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            status: status.to_string(),
            expires_at,
            invisible,
        })
    }

    pub async fn renew(
        &self,
        device_id: &str,
        user_id: &str,
        ttl_seconds: i64,
    ) -> Result<PresenceLease, GatewayError> {
        let existing = db::get_presence_lease(&self.pool, device_id)
            .await?
            .ok_or(GatewayError::NotFound)?;
        self.lease(
            device_id,
            user_id,
            &existing.status,
            ttl_seconds,
            existing.invisible,
        )
        .await
    }

    pub async fn watch(&self, watcher_user_id: &str, target_user_id: &str) -> Result<(), GatewayError> {
        let size = db::watchlist_size(&self.pool, watcher_user_id).await?;
        if size >= self.max_watchlist_size {
            return Err(GatewayError::InvalidRequest {
                message: "watchlist is full".to_string(),
            });
        }
        let watchers = db::watchers_count(&self.pool, target_user_id).await?;
        if watchers >= self.max_watchers_per_target {
            return Err(GatewayError::InvalidRequest {
                message: "target has too many watchers".to_string(),
            });
        }
        db::add_watch(&self.pool, watcher_user_id, target_user_id).await?;
        Ok(())
    }

    pub async fn unwatch(&self, watcher_user_id: &str, target_user_id: &str) -> Result<(), GatewayError> {
        db::remove_watch(&self.pool, watcher_user_id, target_user_id).await?;
        Ok(())
    }

    /// Fans out to watchers that the target also watches back (mutual-watch
    /// gate). Invisible leases are never emitted; there is no allowlist
    /// override in this deployment (see design notes).
    async fn emit_update(
        &self,
        user_id: &str,
        status: &str,
        expires_at: DateTime<Utc>,
        invisible: bool,
    ) -> Result<(), GatewayError> {
        if invisible {
            debug!(user_id, "presence update suppressed: lease is invisible");
            return Ok(());
        }

        let watchers = db::watchers_of(&self.pool, user_id).await?;
        let now = Utc::now();
        for edge in watchers {
            if db::is_mutual_watch(&self.pool, user_id, &edge.watcher_user_id).await? {
                self.hub
                    .emit(
                        &edge.watcher_user_id,
                        PresenceUpdate {
                            user_id: user_id.to_string(),
                            status: status.to_string(),
                            expires_at,
                            last_seen_bucket: LastSeenBucket::from_elapsed(now, now),
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn service() -> PresenceService {
        let pool = db::init_db(&db::DbConfig {
            db_path: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        })
        .await
        .unwrap();
        PresenceService::new(pool, Arc::new(PresenceHub::new(32)), 500, 5000)
    }

    #[tokio::test]
    async fn lease_ttl_is_clamped_to_bounds() {
        let svc = service().await;
        let lease = svc.lease("dev1", "user1", "online", 9999, false).await.unwrap();
        let ttl = (lease.expires_at - Utc::now()).num_seconds();
        assert!(ttl <= LEASE_TTL_MAX + 1);

        let lease = svc.lease("dev1", "user1", "online", 1, false).await.unwrap();
        let ttl = (lease.expires_at - Utc::now()).num_seconds();
        assert!(ttl >= LEASE_TTL_MIN - 1);
    }

    #[tokio::test]
    async fn mutual_watch_gates_presence_fanout() {
        let svc = service().await;
        svc.watch("watcher1", "target1").await.unwrap();
        // Not yet mutual: target1 hasn't watched watcher1 back.
        svc.lease("devT", "target1", "online", 60, false).await.unwrap();

        let mut rx = svc.hub.subscribe("watcher1").await;
        svc.watch("target1", "watcher1").await.unwrap();
        svc.lease("devT", "target1", "online", 60, false).await.unwrap();

        let update = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("update should arrive once watch is mutual")
            .unwrap();
        assert_eq!(update.user_id, "target1");
    }

    #[test]
    fn last_seen_bucket_widens_with_elapsed_time() {
        let now = Utc::now();
        assert_eq!(LastSeenBucket::from_elapsed(now, now), LastSeenBucket::Now);
        assert_eq!(
            LastSeenBucket::from_elapsed(now - ChronoDuration::hours(2), now),
            LastSeenBucket::OneDay
        );
        assert_eq!(
            LastSeenBucket::from_elapsed(now - ChronoDuration::days(10), now),
            LastSeenBucket::SevenDays
        );
    }
}
