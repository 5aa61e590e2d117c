//! Resolved forwarding map: source conversation -> destination recipient.
//!
//! Rebuilt from configuration on startup and after every mutation command.
//! One bad mapping never aborts a rebuild, and readers always see either the
//! old map or the new one, never a partial mix.

use crate::config::ForwardingEntry;
use mm_transport::{ConversationId, Destination, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct ForwardingMap {
    resolved: RwLock<Arc<HashMap<ConversationId, Destination>>>,
}

impl ForwardingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure read against the current snapshot.
    pub async fn lookup(&self, conversation: &ConversationId) -> Option<Destination> {
        self.resolved.read().await.get(conversation).cloned()
    }

    pub async fn len(&self) -> usize {
        self.resolved.read().await.len()
    }

    /// Resolve every configured entry and swap the map in atomically.
    /// Resolution failures are logged and skipped; partial success is success.
    pub async fn rebuild(&self, entries: &[ForwardingEntry], transport: &dyn Transport) -> usize {
        let mut next: HashMap<ConversationId, Destination> = HashMap::with_capacity(entries.len());
        for entry in entries {
            let source = match transport.resolve(&entry.source).await {
                Ok(resolved) => ConversationId::from(resolved.id),
                Err(error) => {
                    tracing::warn!(
                        source = %entry.source,
                        %error,
                        "forwarding source resolution failed; entry skipped"
                    );
                    continue;
                }
            };
            let destination = match transport.resolve(&entry.destination).await {
                Ok(resolved) => resolved,
                Err(error) => {
                    tracing::warn!(
                        source = %entry.source,
                        destination = %entry.destination,
                        %error,
                        "forwarding destination resolution failed; entry skipped"
                    );
                    continue;
                }
            };
            tracing::info!(
                source = %entry.source,
                destination = %destination.display_name,
                "forwarding mapping resolved"
            );
            next.insert(source, destination);
        }

        let count = next.len();
        *self.resolved.write().await = Arc::new(next);
        count
    }
}
