use tokio::sync::{broadcast, oneshot};

use crate::models::ConvEvent;

/// Messages accepted by a [`ConversationActor`](super::conversation::ConversationActor).
///
/// # Message Patterns
///
/// - **Request-reply**: variants with a `reply` field expect a response via
///   a oneshot channel.
/// - **Fire-and-forget**: [`ConvoMessage::Shutdown`] expects no response.
///
/// # Ordering Guarantees
///
/// All messages to one actor are processed sequentially in arrival order.
/// This is what gives `Send` its strict per-conversation `seq` allocation:
/// two concurrent senders racing the same conversation still get distinct,
/// increasing sequence numbers because their `Send` messages are handled
/// one at a time by this actor's mailbox.
#[derive(Debug)]
pub enum ConvoMessage {
    /// Admits a send: allocates the next `seq` (or returns the existing one
    /// for a repeated `msg_id`) and publishes the resulting event to every
    /// live subscriber before replying.
    Send {
        msg_id: String,
        env: Vec<u8>,
        reply: oneshot::Sender<anyhow::Result<SendOutcome>>,
    },

    /// Hands back a receiver on this conversation's live broadcast channel.
    /// Going through the actor mailbox (rather than reading the channel
    /// directly off the registry) means a subscribe that races a send is
    /// ordered relative to it: the caller is guaranteed to either see the
    /// event in its replay query or receive it on the returned receiver,
    /// never neither.
    Subscribe {
        reply: oneshot::Sender<broadcast::Receiver<std::sync::Arc<ConvEvent>>>,
    },

    /// Signals the actor to shut down. In-flight messages already queued
    /// ahead of this one are processed first.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub event: ConvEvent,
    pub duplicate: bool,
}
