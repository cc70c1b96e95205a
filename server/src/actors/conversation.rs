//! The conversation actor: one per conversation, serializing every send
//! through a single mailbox so `seq` allocation and fan-out stay ordered
//! relative to each other without a global lock.

use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::actors::messages::{ConvoMessage, SendOutcome as ActorSendOutcome};
use crate::db::{self, DbPool, SendOutcome};
use crate::models::ConvEvent;

/// Depth of the per-conversation fan-out channel. A subscriber that falls
/// this far behind the live tail gets `RecvError::Lagged` and must fall
/// back to a replay request instead of trusting the broadcast stream.
const BROADCAST_CAPACITY: usize = 256;

pub struct ConversationActor;

pub struct ConvoActorArgs {
    pub conv_id: String,
    pub db_pool: DbPool,
    pub origin_gateway: String,
}

pub struct ConversationActorState {
    conv_id: String,
    db_pool: DbPool,
    origin_gateway: String,
    tx: broadcast::Sender<Arc<ConvEvent>>,
}

#[async_trait]
impl Actor for ConversationActor {
    type Msg = ConvoMessage;
    type State = ConversationActorState;
    type Arguments = ConvoActorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(ConversationActorState {
            conv_id: args.conv_id,
            db_pool: args.db_pool,
            origin_gateway: args.origin_gateway,
            tx,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ConvoMessage::Send { msg_id, env, reply } => {
                let result = state.handle_send(&msg_id, &env).await;
                let _ = reply.send(result);
            }
            ConvoMessage::Subscribe { reply } => {
                let _ = reply.send(state.tx.subscribe());
            }
            ConvoMessage::Shutdown => {
                debug!(conv_id = %state.conv_id, "conversation actor shutting down");
                myself.stop(None);
            }
        }
        Ok(())
    }
}

impl ConversationActorState {
    async fn handle_send(&self, msg_id: &str, env: &[u8]) -> anyhow::Result<ActorSendOutcome> {
        let outcome =
            db::allocate_and_insert(&self.db_pool, &self.conv_id, msg_id, env, &self.origin_gateway)
                .await?;

        match outcome {
            SendOutcome::Inserted(event) => {
                let event = Arc::new(event);
                // No receivers is a normal state (nobody subscribed yet); a
                // failed send here never blocks the sender's own reply.
                if self.tx.send(event.clone()).is_err() {
                    debug!(conv_id = %self.conv_id, "no live subscribers for broadcast event");
                }
                Ok(ActorSendOutcome {
                    event: (*event).clone(),
                    duplicate: false,
                })
            }
            SendOutcome::Duplicate(event) => {
                warn!(conv_id = %self.conv_id, msg_id = %msg_id, "duplicate send observed, replaying prior outcome");
                Ok(ActorSendOutcome {
                    event,
                    duplicate: true,
                })
            }
        }
    }
}
