use crate::{
    bus::{Broadcaster, Channel, Event, Notice, ReadReceipt},
    chat::{ConversationId, MessageId},
    error::{ChatError, Result},
    store::Store,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Moves messages from unread to read on behalf of their recipient and tells
/// subscribers about it.
#[derive(Clone)]
pub struct ReadSync {
    store: Store,
    broadcaster: Arc<dyn Broadcaster>,
}

impl ReadSync {
    pub fn new(store: Store, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { store, broadcaster }
    }

    /// Mark everything the other participant sent as read.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        reader_id: &str,
    ) -> Result<u64> {
        self.mark(conversation_id, reader_id, None).await
    }

    /// Mark only the given messages as read, skipping any the reader sent.
    pub async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        reader_id: &str,
        message_ids: &[MessageId],
    ) -> Result<u64> {
        self.mark(conversation_id, reader_id, Some(message_ids)).await
    }

    async fn mark(
        &self,
        conversation_id: ConversationId,
        reader_id: &str,
        only: Option<&[MessageId]>,
    ) -> Result<u64> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::not_found("conversation"))?;
        if !conversation.is_participant(reader_id) {
            return Err(ChatError::not_found("conversation"));
        }

        let ids = self
            .store
            .unread_ids_from_others(conversation_id, reader_id, only)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let count = self.store.mark_read(conversation_id, &ids).await?;
        debug!(
            "{} read {} message(s) in conversation {}",
            reader_id, count, conversation_id
        );
        // Another session got there first and already announced it
        if count == 0 {
            return Ok(0);
        }

        let receipt = Event::MessageRead(ReadReceipt {
            conversation_id,
            message_ids: ids,
        });
        publish_best_effort(
            self.broadcaster.as_ref(),
            Channel::Conversation(conversation_id),
            receipt,
        )
        .await;
        publish_best_effort(
            self.broadcaster.as_ref(),
            Channel::Global,
            Event::MessageReadNotice(Notice { conversation_id }),
        )
        .await;

        Ok(count)
    }
}

/// Publish and forget. The persisted state already changed, so a lost event
/// only delays other views until their next fetch.
pub(crate) async fn publish_best_effort(broadcaster: &dyn Broadcaster, channel: Channel, event: Event) {
    let name = event.name();
    if let Err(e) = broadcaster.publish(channel, event).await {
        warn!("Dropping {} event for {}: {:#}", name, channel, e);
    }
}
