use crate::types::{ConversationId, Destination, InboundEvent, MessageId};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Run the inbound receive loop, pushing one event per message to `tx`.
    /// Returns only on a fatal failure or when `tx` closes; callers spawn it.
    async fn start(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// Resolve a user-supplied reference (id, @username, link) to a
    /// runtime-stable recipient handle.
    async fn resolve(&self, reference: &str) -> Result<Destination>;

    /// Forward one or more messages from a source conversation to a
    /// destination, preserving order.
    async fn forward(
        &self,
        message_ids: &[MessageId],
        from: &ConversationId,
        to: &Destination,
    ) -> Result<()>;

    /// Send a text message, optionally as an in-thread reply.
    async fn send(
        &self,
        conversation: &ConversationId,
        text: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<()>;

    /// Signal a "composing" presence indicator where the platform supports
    /// one. The default is a no-op.
    async fn set_composing(&self, _conversation: &ConversationId, _active: bool) -> Result<()> {
        Ok(())
    }

    fn supports_composing(&self) -> bool {
        false
    }
}
