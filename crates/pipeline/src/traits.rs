//! Collaborators supplied by the embedding application.

use {async_trait::async_trait, switchboard_common::MessagePayload};

/// The downstream natural-language processing dependency.
///
/// Returns the reply text for a message. An empty reply means nothing should
/// be sent back.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, sender_id: &str, payload: &MessagePayload) -> anyhow::Result<String>;
}

/// Sends already-formatted reply text through the messaging channel.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send(&self, destination_id: &str, text: &str) -> anyhow::Result<()>;
}
