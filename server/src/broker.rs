//! Conversation broker: the admission logic shared verbatim by the
//! WebSocket and SSE/inbox transports so the pair mirrors socket semantics
//! exactly rather than by keeping two hand-written copies in sync.

use std::sync::Arc;

use base64::Engine;
use tokio::sync::broadcast;

use crate::actors::{ActorRegistry, ConvoMessage, SendOutcome};
use crate::config::GatewayConfig;
use crate::db::{self, DbPool};
use crate::error::GatewayError;
use crate::middleware::rate_limit::OperationLimiter;
use crate::models::ConvEvent;

#[derive(Clone)]
pub struct ConversationBroker {
    pool: DbPool,
    registry: Arc<ActorRegistry>,
    limiter: Arc<OperationLimiter>,
    envelope_byte_cap: usize,
}

impl ConversationBroker {
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn new(
        pool: DbPool,
        registry: Arc<ActorRegistry>,
        limiter: Arc<OperationLimiter>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            pool,
            registry,
            limiter,
            envelope_byte_cap: config.envelope_byte_cap,
        }
    }

    /// Resolves `from_seq` (explicit, or the legacy `after_seq+1` hint, or the
    /// stored cursor, defaulting to 1), checks the replay window, and returns
    /// the backlog plus a live receiver registered with the conversation's
    /// actor. Caller is responsible for sending backlog events before
    /// forwarding anything from the receiver, and must drop any live event
    /// whose `seq` falls at or below the last backlog `seq` sent (the
    /// receiver is registered before the backlog query completes, so the two
    /// windows overlap by design rather than leaving a gap).
    pub async fn admit_subscribe(
        &self,
        conv_id: &str,
        device_id: &str,
        from_seq: Option<i64>,
    ) -> Result<(Vec<ConvEvent>, broadcast::Receiver<Arc<ConvEvent>>), GatewayError> {
        if !db::is_member(&self.pool, conv_id, device_id).await? {
            return Err(GatewayError::Forbidden);
        }

        let actor = self.registry.get_or_spawn(conv_id).await?;
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        actor
            .cast(ConvoMessage::Subscribe { reply: reply_tx })
            .map_err(|_| GatewayError::InternalError)?;
        let rx = reply_rx.await.map_err(|_| GatewayError::InternalError)?;

        let from_seq = match from_seq {
            Some(seq) => seq,
            None => db::get_cursor(&self.pool, device_id, conv_id)
                .await?
                .map(|c| c.next_seq)
                .unwrap_or(1),
        };

        if let Some(earliest) = db::earliest_retained_seq(&self.pool, conv_id).await? {
            if from_seq < earliest {
                let latest = db::latest_seq(&self.pool, conv_id).await?;
                return Err(GatewayError::ReplayWindowExceeded {
                    earliest_seq: earliest as u64,
                    latest_seq: latest as u64,
                });
            }
        }

        let backlog = db::replay_from(&self.pool, conv_id, from_seq).await?;
        Ok((backlog, rx))
    }

    /// Admits a send: membership, rate limit, payload cap, blocklist (DM
    /// conversations only), then routes through the conversation actor for
    /// atomic allocate-and-insert and fan-out.
    pub async fn admit_send(
        &self,
        conv_id: &str,
        device_id: &str,
        user_id: &str,
        msg_id: &str,
        env_b64: &str,
    ) -> Result<SendOutcome, GatewayError> {
        if msg_id.is_empty() || msg_id.len() > 256 {
            return Err(GatewayError::InvalidRequest {
                message: "msg_id must be 1-256 characters".to_string(),
            });
        }

        if !db::is_member(&self.pool, conv_id, device_id).await? {
            return Err(GatewayError::Forbidden);
        }

        self.limiter
            .check_send(conv_id, device_id)
            .map_err(|retry_after_s| GatewayError::RateLimited { retry_after_s })?;

        let env = base64::engine::general_purpose::STANDARD
            .decode(env_b64)
            .map_err(|_| GatewayError::InvalidRequest {
                message: "env must be valid base64".to_string(),
            })?;
        if env.len() > self.envelope_byte_cap {
            return Err(GatewayError::InvalidRequest {
                message: "env exceeds envelope_byte_cap".to_string(),
            });
        }

        self.reject_if_blocked(conv_id, device_id, user_id).await?;

        let actor = self.registry.get_or_spawn(conv_id).await?;
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        actor
            .cast(ConvoMessage::Send {
                msg_id: msg_id.to_string(),
                env,
                reply: reply_tx,
            })
            .map_err(|_| GatewayError::InternalError)?;

        reply_rx
            .await
            .map_err(|_| GatewayError::InternalError)?
            .map_err(|_| GatewayError::InternalError)
    }

    async fn reject_if_blocked(
        &self,
        conv_id: &str,
        sender_device_id: &str,
        sender_user_id: &str,
    ) -> Result<(), GatewayError> {
        let Some(conv) = db::get_conversation(&self.pool, conv_id).await? else {
            return Ok(());
        };
        if conv.kind != "dm" {
            return Ok(());
        }
        for member in db::list_members(&self.pool, conv_id).await? {
            if member.device_id == sender_device_id {
                continue;
            }
            if let Some(other_device) = db::get_device(&self.pool, &member.device_id).await? {
                if db::is_blocked(&self.pool, sender_user_id, &other_device.user_id).await? {
                    return Err(GatewayError::Blocked);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn broker() -> ConversationBroker {
        let pool = db::init_db(&db::DbConfig {
            db_path: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        })
        .await
        .unwrap();
        let registry = Arc::new(ActorRegistry::new(pool.clone(), "gw_test".to_string()));
        let config = GatewayConfig {
            gateway_id: "gw_test".to_string(),
            ..GatewayConfig::from_env()
        };
        let limiter = Arc::new(OperationLimiter::new(&config.rate_limits));
        ConversationBroker::new(pool, registry, limiter, &config)
    }

    #[tokio::test]
    async fn send_rejects_non_members() {
        let b = broker().await;
        db::ensure_conversation(&b.pool, "conv1", "gw_test", "group", None)
            .await
            .unwrap();
        let err = b
            .admit_send("conv1", "dev1", "user1", "m1", "aGVsbG8=")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn send_rejects_invalid_base64() {
        let b = broker().await;
        db::ensure_conversation(&b.pool, "conv1", "gw_test", "group", None)
            .await
            .unwrap();
        db::add_member(&b.pool, "conv1", "dev1", false).await.unwrap();
        let err = b
            .admit_send("conv1", "dev1", "user1", "m1", "not-valid-base64!!")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[tokio::test]
    async fn dm_send_blocked_by_recipient_is_rejected() {
        let b = broker().await;
        db::ensure_conversation(&b.pool, "dm1", "gw_test", "dm", None)
            .await
            .unwrap();
        db::add_member(&b.pool, "dm1", "dev1", false).await.unwrap();
        db::add_member(&b.pool, "dm1", "dev2", false).await.unwrap();
        db::ensure_device(&b.pool, "dev1", "user1", "cred").await.unwrap();
        db::ensure_device(&b.pool, "dev2", "user2", "cred").await.unwrap();
        db::block_user(&b.pool, "user2", "user1").await.unwrap();

        let err = b
            .admit_send("dm1", "dev1", "user1", "m1", "aGVsbG8=")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "blocked");
    }

    #[tokio::test]
    async fn subscribe_respects_replay_window() {
        let b = broker().await;
        db::ensure_conversation(&b.pool, "conv1", "gw_test", "group", None)
            .await
            .unwrap();
        db::add_member(&b.pool, "conv1", "dev1", false).await.unwrap();

        b.admit_send("conv1", "dev1", "user1", "m1", "aGVsbG8=").await.unwrap();

        let (backlog, _rx) = b.admit_subscribe("conv1", "dev1", Some(1)).await.unwrap();
        assert_eq!(backlog.len(), 1);

        let err = b.admit_subscribe("conv1", "dev1", Some(0)).await.unwrap_err();
        assert_eq!(err.code(), "replay_window_exceeded");
    }
}
