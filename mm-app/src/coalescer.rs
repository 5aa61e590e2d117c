//! Media-group debounce buffer.
//!
//! Multi-part posts arrive as separate events in rapid succession with no
//! "group complete" signal; a fixed quiescence window after the last part is
//! the only practical completion test. Every new part cancels the pending
//! flush and schedules a fresh one, so the batch goes out exactly once, one
//! quiescence delay after the final part.

use mm_transport::{ConversationId, Destination, GroupId, MessageId, Transport};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct GroupBuffer {
    source: ConversationId,
    /// The first part of a group fixes the destination for the whole group.
    destination: Destination,
    message_ids: Vec<MessageId>,
    /// Bumped on every arrival; a flush task carrying a stale epoch has been
    /// superseded and must do nothing even if it already fired.
    epoch: u64,
    flush_task: Option<JoinHandle<()>>,
}

pub struct MediaGroupCoalescer {
    transport: Arc<dyn Transport>,
    quiescence: Duration,
    groups: Arc<Mutex<HashMap<GroupId, GroupBuffer>>>,
}

impl MediaGroupCoalescer {
    pub fn new(transport: Arc<dyn Transport>, quiescence: Duration) -> Self {
        Self {
            transport,
            quiescence,
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Route one message: non-grouped messages forward immediately and
    /// independently; grouped messages are buffered behind the single
    /// coalescing lock until their group goes quiet.
    pub async fn on_message(
        &self,
        group_id: Option<&GroupId>,
        message_id: MessageId,
        source: &ConversationId,
        destination: &Destination,
    ) {
        let Some(group_id) = group_id else {
            if let Err(error) = self
                .transport
                .forward(&[message_id.clone()], source, destination)
                .await
            {
                tracing::warn!(
                    %error,
                    %message_id,
                    source = %source,
                    "forward failed; message dropped"
                );
            }
            return;
        };

        let mut groups = self.groups.lock().await;
        let buffer = groups.entry(group_id.clone()).or_insert_with(|| GroupBuffer {
            source: source.clone(),
            destination: destination.clone(),
            message_ids: Vec::new(),
            epoch: 0,
            flush_task: None,
        });
        buffer.message_ids.push(message_id);
        buffer.epoch += 1;
        if let Some(task) = buffer.flush_task.take() {
            task.abort();
        }

        let epoch = buffer.epoch;
        let transport = Arc::clone(&self.transport);
        let groups_handle = Arc::clone(&self.groups);
        let group = group_id.clone();
        let quiescence = self.quiescence;
        buffer.flush_task = Some(tokio::spawn(async move {
            flush_after_quiescence(transport, groups_handle, group, epoch, quiescence).await;
        }));
    }

    #[cfg(test)]
    async fn pending_groups(&self) -> usize {
        self.groups.lock().await.len()
    }
}

async fn flush_after_quiescence(
    transport: Arc<dyn Transport>,
    groups: Arc<Mutex<HashMap<GroupId, GroupBuffer>>>,
    group_id: GroupId,
    epoch: u64,
    quiescence: Duration,
) {
    tokio::time::sleep(quiescence).await;

    // Remove under the lock, forward outside it: a slow transport must not
    // stall arrivals for other groups.
    let batch = {
        let mut groups = groups.lock().await;
        match groups.get(&group_id) {
            Some(buffer) if buffer.epoch == epoch => groups.remove(&group_id),
            _ => None,
        }
    };
    let Some(buffer) = batch else {
        // Superseded by a newer arrival between firing and locking.
        return;
    };

    let count = buffer.message_ids.len();
    if let Err(error) = transport
        .forward(&buffer.message_ids, &buffer.source, &buffer.destination)
        .await
    {
        // No retry: a partial resend could duplicate already-delivered parts.
        tracing::warn!(
            %error,
            group = %group_id,
            count,
            "media group forward failed; batch discarded"
        );
    } else {
        tracing::debug!(group = %group_id, count, "media group forwarded");
    }
}
