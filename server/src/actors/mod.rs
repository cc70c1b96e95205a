mod conversation;
mod messages;
mod registry;

pub use conversation::{ConversationActor, ConvoActorArgs};
pub use messages::{ConvoMessage, SendOutcome};
pub use registry::ActorRegistry;

#[cfg(test)]
mod tests;
