use async_trait::async_trait;
use std::sync::Arc;

use crate::bus::Channel;
use crate::chat::{Conversation, ConversationId, ConversationSummary, Message, MessageId};
use crate::client::subscription::Subscription;
use crate::error::Result;
use crate::manager::Manager;

/// What a view needs from the service, on behalf of one signed-in user.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn user_id(&self) -> &str;

    async fn resolve_conversation(&self, offer_id: &str) -> Result<Conversation>;

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;

    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>>;

    async fn send_message(&self, conversation_id: ConversationId, text: &str) -> Result<Message>;

    /// Mark messages from the counterpart read; `only` narrows it to those ids.
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        only: Option<&[MessageId]>,
    ) -> Result<u64>;

    async fn unread_count(&self) -> Result<u64>;

    async fn subscribe(&self, channel: Channel) -> Result<Subscription>;
}

/// Backend talking to an in-process [`Manager`].
#[derive(Clone)]
pub struct LocalBackend {
    manager: Arc<Manager>,
    user_id: String,
}

impl LocalBackend {
    pub fn new(manager: Arc<Manager>, user_id: impl Into<String>) -> Self {
        Self {
            manager,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl ChatBackend for LocalBackend {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn resolve_conversation(&self, offer_id: &str) -> Result<Conversation> {
        self.manager
            .resolve_conversation(&self.user_id, offer_id)
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.manager.list_conversations(&self.user_id).await
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.manager
            .list_messages(conversation_id, &self.user_id)
            .await
    }

    async fn send_message(&self, conversation_id: ConversationId, text: &str) -> Result<Message> {
        self.manager
            .send_message(conversation_id, &self.user_id, text)
            .await
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        only: Option<&[MessageId]>,
    ) -> Result<u64> {
        self.manager
            .mark_read(conversation_id, &self.user_id, only)
            .await
    }

    async fn unread_count(&self) -> Result<u64> {
        self.manager.unread_count(&self.user_id).await
    }

    async fn subscribe(&self, channel: Channel) -> Result<Subscription> {
        let rx = self.manager.subscribe(channel, &self.user_id).await?;
        Ok(Subscription::from_relay(channel, rx))
    }
}
