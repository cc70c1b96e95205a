use dashmap::DashMap;
use ractor::ActorRef;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::conversation::{ConversationActor, ConvoActorArgs};
use super::messages::ConvoMessage;
use crate::db::DbPool;

/// Central registry for managing conversation actor lifecycle.
///
/// The `ActorRegistry` is responsible for:
/// - Spawning new conversation actors on-demand
/// - Caching actor references for reuse
/// - Tracking the count of active actors
/// - Coordinating graceful shutdown of all actors
///
/// # Thread Safety
///
/// This registry uses [`DashMap`] internally for lock-free concurrent access,
/// allowing multiple threads to spawn and retrieve actors simultaneously
/// without contention. The registry itself is cheaply clonable via [`Arc`].
///
/// # Actor Lifecycle
///
/// 1. **Spawn**: actors are created lazily when first accessed via [`get_or_spawn`]
/// 2. **Reuse**: subsequent requests for the same conversation reuse the existing actor
/// 3. **Removal**: actors can be manually removed via [`remove_actor`]
/// 4. **Shutdown**: all actors can be stopped gracefully via [`shutdown_all`]
///
/// [`get_or_spawn`]: ActorRegistry::get_or_spawn
/// [`remove_actor`]: ActorRegistry::remove_actor
/// [`shutdown_all`]: ActorRegistry::shutdown_all
pub struct ActorRegistry {
    actors: Arc<DashMap<String, ActorRef<ConvoMessage>>>,
    db_pool: DbPool,
    origin_gateway: String,
}

impl ActorRegistry {
    pub fn new(db_pool: DbPool, origin_gateway: String) -> Self {
        info!("initializing actor registry");
        Self {
            actors: Arc::new(DashMap::new()),
            db_pool,
            origin_gateway,
        }
    }

    /// Retrieves an existing actor or spawns a new one for the given conversation.
    ///
    /// Multiple concurrent calls with the same `conv_id` may spawn duplicate
    /// actors momentarily, but only one survives in the registry; the rest
    /// are dropped and stop on their own with no subscribers or further
    /// messages. The spec's ordering guarantees come from the registry
    /// entry that actually lands, not from preventing the race.
    pub async fn get_or_spawn(&self, conv_id: &str) -> anyhow::Result<ActorRef<ConvoMessage>> {
        if let Some(actor_ref) = self.actors.get(conv_id) {
            debug!(conv_id, "using existing actor for conversation");
            return Ok(actor_ref.clone());
        }

        debug!(conv_id, "spawning new actor for conversation");

        let args = ConvoActorArgs {
            conv_id: conv_id.to_string(),
            db_pool: self.db_pool.clone(),
            origin_gateway: self.origin_gateway.clone(),
        };

        let (actor_ref, _handle) = ractor::Actor::spawn(None, ConversationActor, args)
            .await
            .map_err(|e| anyhow::anyhow!("failed to spawn actor: {e}"))?;

        self.actors.insert(conv_id.to_string(), actor_ref.clone());

        info!(conv_id, total = self.actor_count(), "actor spawned");

        Ok(actor_ref)
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    pub fn remove_actor(&self, conv_id: &str) {
        if self.actors.remove(conv_id).is_some() {
            info!(conv_id, remaining = self.actor_count(), "removed actor");
        } else {
            warn!(conv_id, "attempted to remove non-existent actor");
        }
    }

    /// Sends [`ConvoMessage::Shutdown`] to every active actor and clears the
    /// registry. Actors finish in-flight messages before stopping.
    pub async fn shutdown_all(&self) {
        info!(count = self.actor_count(), "shutting down all actors");

        for entry in self.actors.iter() {
            let _ = entry.value().cast(ConvoMessage::Shutdown);
        }

        self.actors.clear();
        info!("all actors shut down");
    }
}

impl Clone for ActorRegistry {
    fn clone(&self) -> Self {
        Self {
            actors: Arc::clone(&self.actors),
            db_pool: self.db_pool.clone(),
            origin_gateway: self.origin_gateway.clone(),
        }
    }
}
