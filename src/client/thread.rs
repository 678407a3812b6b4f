use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bus::{Channel, Event};
use crate::chat::{ConversationId, Message, MessageId};
use crate::client::backend::ChatBackend;
use crate::client::subscription::Subscription;
use crate::error::Result;

/// Local state of one open conversation thread.
///
/// History is fetched before subscribing; incoming messages are appended in
/// arrival order and keyed by id, so a message seen twice is applied once.
pub struct ThreadView<B: ChatBackend> {
    backend: Arc<B>,
    conversation_id: ConversationId,
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
    subscription: Subscription,
}

impl<B: ChatBackend> ThreadView<B> {
    pub async fn open(backend: Arc<B>, conversation_id: ConversationId) -> Result<Self> {
        let history = backend.list_messages(conversation_id).await?;
        let viewer = backend.user_id().to_string();

        let subscription = backend
            .subscribe(Channel::Conversation(conversation_id))
            .await?;

        let mut view = Self {
            backend,
            conversation_id,
            messages: Vec::new(),
            index: HashMap::new(),
            subscription,
        };
        view.merge(history);

        // Anything stored between the first fetch and the subscription
        // going live only shows up in a second fetch.
        let catch_up = view.backend.list_messages(conversation_id).await?;
        view.merge(catch_up);

        if view.messages.iter().any(|m| m.sender_id != viewer && !m.read) {
            view.backend.mark_read(conversation_id, None).await?;
            for m in view.messages.iter_mut().filter(|m| m.sender_id != viewer) {
                m.read = true;
            }
        }

        debug!(
            "{} opened conversation {} with {} message(s)",
            viewer,
            conversation_id,
            view.messages.len()
        );
        Ok(view)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.index.get(&id).map(|&i| &self.messages[i])
    }

    /// Messages from the counterpart that are still unread locally.
    pub fn unread_count(&self) -> usize {
        let viewer = self.backend.user_id();
        self.messages
            .iter()
            .filter(|m| m.sender_id != viewer && !m.read)
            .count()
    }

    pub async fn send(&mut self, text: &str) -> Result<Message> {
        let message = self
            .backend
            .send_message(self.conversation_id, text)
            .await?;
        self.append(message.clone());
        Ok(message)
    }

    /// Wait for the next event on the thread's channel and apply it.
    /// Returns `None` when the subscription ends.
    pub async fn next_event(&mut self) -> Option<Event> {
        let event = self.subscription.next().await?;
        self.apply(&event).await;
        Some(event)
    }

    /// Apply every event already buffered, without waiting.
    pub async fn drain(&mut self) -> usize {
        let mut applied = 0;
        while let Some(event) = self.subscription.try_next() {
            self.apply(&event).await;
            applied += 1;
        }
        applied
    }

    /// Reconcile local state with one event. Returns whether anything changed.
    pub async fn apply(&mut self, event: &Event) -> bool {
        if event.conversation_id() != self.conversation_id {
            return false;
        }

        match event {
            Event::NewMessage(message) => {
                if !self.append(message.clone()) {
                    return false;
                }
                if message.sender_id != self.backend.user_id() && !message.read {
                    self.read_incoming(message.id).await;
                }
                true
            }
            Event::MessageRead(receipt) => {
                let mut changed = false;
                for id in &receipt.message_ids {
                    if let Some(&i) = self.index.get(id) {
                        changed |= !self.messages[i].read;
                        self.messages[i].read = true;
                    }
                }
                changed
            }
            Event::NewMessageNotice(_) | Event::MessageReadNotice(_) => false,
        }
    }

    /// The viewer has the thread open, so an incoming message is read on arrival.
    async fn read_incoming(&mut self, id: MessageId) {
        match self
            .backend
            .mark_read(self.conversation_id, Some(std::slice::from_ref(&id)))
            .await
        {
            Ok(_) => {
                if let Some(&i) = self.index.get(&id) {
                    self.messages[i].read = true;
                }
            }
            Err(e) => warn!(
                "Failed to mark message {} read in conversation {}: {}",
                id, self.conversation_id, e
            ),
        }
    }

    fn append(&mut self, message: Message) -> bool {
        if self.index.contains_key(&message.id) {
            return false;
        }
        self.index.insert(message.id, self.messages.len());
        self.messages.push(message);
        true
    }

    /// Fold a full fetch into local state. The fetch is authoritative for read
    /// flags, which only ever go from false to true.
    fn merge(&mut self, fetched: Vec<Message>) {
        let mut inserted = false;
        for message in fetched {
            match self.index.get(&message.id) {
                Some(&i) => self.messages[i].read |= message.read,
                None => {
                    self.index.insert(message.id, self.messages.len());
                    self.messages.push(message);
                    inserted = true;
                }
            }
        }

        if inserted {
            self.messages
                .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            self.index = self
                .messages
                .iter()
                .enumerate()
                .map(|(i, m)| (m.id, i))
                .collect();
        }
    }
}
