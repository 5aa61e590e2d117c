//! Conversation-keyed state table.
//!
//! All per-conversation mutable state (sender window, context window,
//! last-reply timestamp, alert status, manual queue) lives here, and every
//! mutation goes through this store's methods. Entries are created lazily on
//! first use and bounded by their own caps, so they are never explicitly
//! destroyed.

use crate::activity::SenderWindow;
use crate::alert::{AlertRecord, AlertState, ManualMessage, ManualQueue};
use crate::context::{ContextLine, ContextWindow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mm_transport::{ConversationId, MessageId, SenderId};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct ConversationState {
    senders: SenderWindow,
    context: ContextWindow,
    last_reply_at: Option<DateTime<Utc>>,
    alert: AlertState,
    manual_queue: ManualQueue,
    /// Serializes manual-queue delivery so concurrent drains stay FIFO.
    delivery_lock: Arc<Mutex<()>>,
}

#[derive(Default)]
pub struct ConversationStore {
    conversations: DashMap<ConversationId, ConversationState>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sender(&self, conversation: &ConversationId, sender: SenderId, at: DateTime<Utc>) {
        self.entry(conversation).senders.record(sender, at);
    }

    pub fn active_user_count(
        &self,
        conversation: &ConversationId,
        window_minutes: i64,
        now: DateTime<Utc>,
    ) -> usize {
        self.conversations
            .get(conversation)
            .map(|state| state.senders.active_user_count(window_minutes, now))
            .unwrap_or(0)
    }

    pub fn push_context(
        &self,
        conversation: &ConversationId,
        role: &str,
        content: &str,
        at: DateTime<Utc>,
        cap: usize,
    ) {
        self.entry(conversation).context.push(role, content, at, cap);
    }

    pub fn context_tail(&self, conversation: &ConversationId, limit: usize) -> Vec<ContextLine> {
        self.conversations
            .get(conversation)
            .map(|state| state.context.tail(limit))
            .unwrap_or_default()
    }

    pub fn last_reply_at(&self, conversation: &ConversationId) -> Option<DateTime<Utc>> {
        self.conversations
            .get(conversation)
            .and_then(|state| state.last_reply_at)
    }

    pub fn mark_replied(&self, conversation: &ConversationId, at: DateTime<Utc>) {
        self.entry(conversation).last_reply_at = Some(at);
    }

    /// Returns true only on the Armed -> Suspended transition.
    pub fn trigger_alert(
        &self,
        conversation: &ConversationId,
        keyword: &str,
        message_text: &str,
        sender: &str,
        at: DateTime<Utc>,
    ) -> bool {
        self.entry(conversation)
            .alert
            .trigger(keyword, message_text, sender, at)
    }

    /// Idempotent; returns true when the conversation was suspended.
    pub fn clear_alert(&self, conversation: &ConversationId) -> bool {
        self.entry(conversation).alert.clear()
    }

    pub fn is_suspended(&self, conversation: &ConversationId) -> bool {
        self.conversations
            .get(conversation)
            .map(|state| state.alert.is_triggered())
            .unwrap_or(false)
    }

    pub fn last_alert(&self, conversation: &ConversationId) -> Option<AlertRecord> {
        self.conversations
            .get(conversation)
            .and_then(|state| state.alert.records().last().cloned())
    }

    pub fn suspended_conversations(&self) -> Vec<ConversationId> {
        let mut out: Vec<ConversationId> = self
            .conversations
            .iter()
            .filter(|entry| entry.value().alert.is_triggered())
            .map(|entry| entry.key().clone())
            .collect();
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        out
    }

    pub fn enqueue_manual(
        &self,
        conversation: &ConversationId,
        text: String,
        reply_to: Option<MessageId>,
    ) {
        self.entry(conversation).manual_queue.enqueue(text, reply_to);
    }

    pub fn dequeue_manual(&self, conversation: &ConversationId) -> Option<ManualMessage> {
        self.conversations
            .get_mut(conversation)
            .and_then(|mut state| state.manual_queue.dequeue())
    }

    /// Handle to the conversation's delivery lock; holders drain the manual
    /// queue one at a time.
    pub fn delivery_lock(&self, conversation: &ConversationId) -> Arc<Mutex<()>> {
        Arc::clone(&self.entry(conversation).delivery_lock)
    }

    fn entry(
        &self,
        conversation: &ConversationId,
    ) -> dashmap::mapref::one::RefMut<'_, ConversationId, ConversationState> {
        self.conversations
            .entry(conversation.clone())
            .or_default()
    }
}
