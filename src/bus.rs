use crate::chat::{ConversationId, Message, MessageId};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};

pub const GLOBAL_CHANNEL: &str = "global-messages";
const CONVERSATION_PREFIX: &str = "conversation-";

pub const NEW_MESSAGE: &str = "new-message";
pub const MESSAGE_READ: &str = "message-read";

/// A topic on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Full events for a single conversation
    Conversation(ConversationId),
    /// Body-less notices for every conversation, used for unread badges
    Global,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Conversation(id) => write!(f, "{}{}", CONVERSATION_PREFIX, id),
            Channel::Global => f.write_str(GLOBAL_CHANNEL),
        }
    }
}

impl FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == GLOBAL_CHANNEL {
            return Ok(Channel::Global);
        }
        let id = s
            .strip_prefix(CONVERSATION_PREFIX)
            .ok_or_else(|| anyhow!("unknown channel '{}'", s))?;
        let id = id
            .parse::<ConversationId>()
            .with_context(|| format!("invalid conversation id in channel '{}'", s))?;
        Ok(Channel::Conversation(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A message was appended to a conversation
    NewMessage(Message),

    /// Messages of a conversation were read by their recipient
    MessageRead(ReadReceipt),

    /// Global counterpart of `NewMessage`, without the body
    NewMessageNotice(Notice),

    /// Global counterpart of `MessageRead`
    MessageReadNotice(Notice),
}

impl Event {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Event::NewMessage(_) | Event::NewMessageNotice(_) => NEW_MESSAGE,
            Event::MessageRead(_) | Event::MessageReadNotice(_) => MESSAGE_READ,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Event::NewMessage(m) => m.conversation_id,
            Event::MessageRead(r) => r.conversation_id,
            Event::NewMessageNotice(n) | Event::MessageReadNotice(n) => n.conversation_id,
        }
    }

    /// JSON payload carried under the event name.
    pub fn payload(&self) -> serde_json::Value {
        let value = match self {
            Event::NewMessage(m) => serde_json::to_value(m),
            Event::MessageRead(r) => serde_json::to_value(r),
            Event::NewMessageNotice(n) | Event::MessageReadNotice(n) => serde_json::to_value(n),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    /// Rebuild an event from what a subscriber sees: the channel it listens
    /// on, the event name and the JSON payload.
    pub fn decode(channel: Channel, name: &str, data: &str) -> anyhow::Result<Self> {
        let event = match (channel, name) {
            (Channel::Conversation(_), NEW_MESSAGE) => Event::NewMessage(serde_json::from_str(data)?),
            (Channel::Conversation(_), MESSAGE_READ) => {
                Event::MessageRead(serde_json::from_str(data)?)
            }
            (Channel::Global, NEW_MESSAGE) => Event::NewMessageNotice(serde_json::from_str(data)?),
            (Channel::Global, MESSAGE_READ) => Event::MessageReadNotice(serde_json::from_str(data)?),
            (_, other) => return Err(anyhow!("unknown event '{}' on {}", other, channel)),
        };
        Ok(event)
    }
}

/// Publishing side of the relay.
///
/// Delivery is at most once: callers log a failed publish and move on, the
/// store stays the source of truth.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn publish(&self, channel: Channel, event: Event) -> anyhow::Result<()>;
}

/// In-process topic relay. One broadcast sender per channel, created on first
/// use and pruned once nobody listens.
pub struct Relay {
    capacity: usize,
    topics: Mutex<HashMap<Channel, broadcast::Sender<Event>>>,
}

impl Relay {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Event> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.retain(|_, tx| tx.receiver_count() > 0);
        let rx = topics
            .entry(channel)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!("Subscribed to {} ({} topics live)", channel, topics.len());
        rx
    }

    /// Number of live receivers on a channel.
    pub fn subscriber_count(&self, channel: Channel) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(&channel).map_or(0, |tx| tx.receiver_count())
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl Broadcaster for Relay {
    async fn publish(&self, channel: Channel, event: Event) -> anyhow::Result<()> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        match topics.get(&channel) {
            // We ignore the error if there are no receivers
            Some(tx) => {
                let delivered = tx.send(event).unwrap_or(0);
                trace!("Published to {} ({} receivers)", channel, delivered);
            }
            None => trace!("Dropped event for {}: no subscribers", channel),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: MessageId) -> Message {
        Message {
            id,
            conversation_id: 7,
            sender_id: "alice".into(),
            text: "hi".into(),
            read: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn channel_names_round_trip() {
        assert_eq!(Channel::Conversation(42).to_string(), "conversation-42");
        assert_eq!(Channel::Global.to_string(), "global-messages");
        assert_eq!("conversation-42".parse::<Channel>().unwrap(), Channel::Conversation(42));
        assert_eq!("global-messages".parse::<Channel>().unwrap(), Channel::Global);
        assert!("conversation-x".parse::<Channel>().is_err());
        assert!("lobby".parse::<Channel>().is_err());
    }

    #[test]
    fn read_payload_uses_message_ids_key() {
        let event = Event::MessageRead(ReadReceipt {
            conversation_id: 7,
            message_ids: vec![1, 2],
        });
        assert_eq!(event.name(), "message-read");
        assert_eq!(event.payload()["messageIds"], serde_json::json!([1, 2]));
    }

    #[test]
    fn decode_depends_on_channel_kind() {
        let full = Event::NewMessage(message(3));
        let data = full.payload().to_string();
        let decoded = Event::decode(Channel::Conversation(7), NEW_MESSAGE, &data).unwrap();
        assert_eq!(decoded, full);

        let notice = Event::decode(Channel::Global, NEW_MESSAGE, r#"{"conversationId":7}"#).unwrap();
        assert_eq!(notice, Event::NewMessageNotice(Notice { conversation_id: 7 }));

        assert!(Event::decode(Channel::Global, "typing", "{}").is_err());
    }

    #[tokio::test]
    async fn relay_delivers_in_publish_order_per_topic() {
        let relay = Relay::new(16);
        let mut rx = relay.subscribe(Channel::Conversation(7));
        let mut other = relay.subscribe(Channel::Conversation(8));

        for id in 1..=3 {
            relay
                .publish(Channel::Conversation(7), Event::NewMessage(message(id)))
                .await
                .unwrap();
        }

        for id in 1..=3 {
            match rx.recv().await.unwrap() {
                Event::NewMessage(m) => assert_eq!(m.id, id),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_silent_drop() {
        let relay = Relay::new(4);
        relay
            .publish(Channel::Global, Event::NewMessageNotice(Notice { conversation_id: 1 }))
            .await
            .unwrap();

        let rx = relay.subscribe(Channel::Global);
        assert_eq!(relay.subscriber_count(Channel::Global), 1);
        drop(rx);
        assert_eq!(relay.subscriber_count(Channel::Global), 0);
    }
}
