use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ConversationId = i64;
pub type MessageId = i64;

/// One buyer, one seller and the offer they talk about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub offer_id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }

    /// The participant that is not `user_id`.
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        if self.buyer_id == user_id {
            Some(&self.seller_id)
        } else if self.seller_id == user_id {
            Some(&self.buyer_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub text: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Conversation list entry: the last message plus everything the viewer has
/// not read yet from the other side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub last_message: Option<Message>,
    pub unread: Vec<Message>,
}

impl ConversationSummary {
    pub fn unread_count(&self) -> usize {
        self.unread.len()
    }

    /// Timestamp the conversation list is sorted by.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|m| m.created_at)
            .unwrap_or(self.conversation.created_at)
    }
}
