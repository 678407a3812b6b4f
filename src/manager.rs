use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::bus::{Broadcaster, Channel, Event, Notice, Relay};
use crate::chat::{Conversation, ConversationId, ConversationSummary, Message, MessageId};
use crate::error::{ChatError, Result};
use crate::resolver;
use crate::store::Store;
use crate::sync::{publish_best_effort, ReadSync};

/// Entry point for everything a request handler or a local client needs:
/// conversations, messages, read receipts and subscriptions.
pub struct Manager {
    store: Store,
    relay: Arc<Relay>,
    broadcaster: Arc<dyn Broadcaster>,
    read_sync: ReadSync,
}

impl Manager {
    pub fn new(store: Store, relay: Arc<Relay>) -> Self {
        let broadcaster: Arc<dyn Broadcaster> = relay.clone();
        Self::with_broadcaster(store, relay, broadcaster)
    }

    /// Publish through `broadcaster` while subscriptions still come from `relay`.
    pub fn with_broadcaster(
        store: Store,
        relay: Arc<Relay>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let read_sync = ReadSync::new(store.clone(), broadcaster.clone());
        Self {
            store,
            relay,
            broadcaster,
            read_sync,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn resolve_conversation(
        &self,
        requester_id: &str,
        offer_id: &str,
    ) -> Result<Conversation> {
        resolver::resolve_or_create(&self.store, requester_id, offer_id).await
    }

    /// Persist a message, then announce it. The message counts as sent once
    /// stored, whatever happens to the broadcast.
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        sender_id: &str,
        text: &str,
    ) -> Result<Message> {
        let message = self
            .store
            .append_message(conversation_id, sender_id, text)
            .await?;
        info!(
            "Message {} from {} in conversation {}",
            message.id, sender_id, conversation_id
        );

        publish_best_effort(
            self.broadcaster.as_ref(),
            Channel::Conversation(conversation_id),
            Event::NewMessage(message.clone()),
        )
        .await;
        publish_best_effort(
            self.broadcaster.as_ref(),
            Channel::Global,
            Event::NewMessageNotice(Notice { conversation_id }),
        )
        .await;

        Ok(message)
    }

    /// Messages of a conversation the viewer takes part in.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        viewer_id: &str,
    ) -> Result<Vec<Message>> {
        self.conversation_for(conversation_id, viewer_id).await?;
        self.store.list_messages(conversation_id).await
    }

    /// Mark messages from the counterpart as read. With `only` set, just those ids.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: &str,
        only: Option<&[MessageId]>,
    ) -> Result<u64> {
        match only {
            Some(ids) => {
                self.read_sync
                    .mark_messages_read(conversation_id, reader_id, ids)
                    .await
            }
            None => {
                self.read_sync
                    .mark_conversation_read(conversation_id, reader_id)
                    .await
            }
        }
    }

    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        self.store.list_conversations_for_user(user_id).await
    }

    /// Value of the navigation badge: unread messages across all conversations.
    pub async fn unread_count(&self, user_id: &str) -> Result<u64> {
        let count = self.store.unread_count_for_user(user_id).await?;
        Ok(count.max(0) as u64)
    }

    /// Whether `user_id` is the buyer or seller of the conversation. Unknown
    /// conversations count as not.
    pub async fn is_participant(
        &self,
        conversation_id: ConversationId,
        user_id: &str,
    ) -> Result<bool> {
        Ok(self
            .store
            .get_conversation(conversation_id)
            .await?
            .is_some_and(|c| c.is_participant(user_id)))
    }

    /// Subscribe `user_id` to a channel. Conversation channels are only open
    /// to the two participants.
    ///
    /// The global channel carries notices for every conversation. In-process
    /// subscribers get all of them; the SSE endpoint forwards a user only the
    /// notices of their own conversations.
    pub async fn subscribe(
        &self,
        channel: Channel,
        user_id: &str,
    ) -> Result<broadcast::Receiver<Event>> {
        if let Channel::Conversation(id) = channel {
            self.conversation_for(id, user_id).await?;
        }
        Ok(self.relay.subscribe(channel))
    }

    async fn conversation_for(
        &self,
        conversation_id: ConversationId,
        user_id: &str,
    ) -> Result<Conversation> {
        match self.store.get_conversation(conversation_id).await? {
            Some(c) if c.is_participant(user_id) => Ok(c),
            _ => Err(ChatError::not_found("conversation")),
        }
    }
}
