use crate::{
    chat::{Conversation, ConversationId, ConversationSummary, Message, MessageId},
    entity::{Offer, OfferAttributes, User},
    error::{ChatError, Result},
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{
    query::Query,
    sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqliteRow},
    ConnectOptions, QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::{path::Path, str::FromStr, time::Duration};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    ///
    /// Timestamps are stored as epoch milliseconds so ordering is numeric.
    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL,
                image TEXT
            );

            CREATE TABLE IF NOT EXISTS offers (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                attributes TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                offer_id TEXT NOT NULL REFERENCES offers(id) ON DELETE CASCADE,
                buyer_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                seller_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                UNIQUE (offer_id, buyer_id, seller_id),
                CHECK (buyer_id <> seller_id)
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_buyer ON conversations(buyer_id);
            CREATE INDEX IF NOT EXISTS idx_conversations_seller ON conversations(seller_id);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                text TEXT NOT NULL CHECK (length(trim(text)) > 0),
                read INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation_order
                ON messages(conversation_id, created_at, id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Users and offers (owned by other services, kept minimal here)
    // -------------------------------------------------------------------------

    /// Save or update a user.
    pub async fn insert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, email, image)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                image = excluded.image
            "#,
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.image)
        .execute(&self.pool)
        .await
        .context("Failed to save user")?;

        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = first_row(
            &self.pool,
            sqlx::query("SELECT id, name, email, image FROM users WHERE id = ?").bind(user_id),
        )
        .await
        .context("Failed to fetch user")?;

        row.map(|row| -> Result<User> {
            Ok(User {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                email: row.try_get("email")?,
                image: row.try_get("image")?,
            })
        })
        .transpose()
    }

    /// Delete a user account. Their offers, conversations and messages go with it.
    pub async fn delete_user(&self, user_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete user")?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn insert_offer(&self, offer: &Offer) -> Result<()> {
        let attributes =
            serde_json::to_string(&offer.attributes).context("Failed to encode offer attributes")?;

        sqlx::query(
            r#"
            INSERT INTO offers (id, owner_id, title, attributes, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                attributes = excluded.attributes
            "#,
        )
        .bind(&offer.id)
        .bind(&offer.owner_id)
        .bind(&offer.title)
        .bind(attributes)
        .bind(offer.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save offer")?;

        Ok(())
    }

    pub async fn get_offer(&self, offer_id: &str) -> Result<Option<Offer>> {
        let row = first_row(
            &self.pool,
            sqlx::query(
                "SELECT id, owner_id, title, attributes, created_at FROM offers WHERE id = ?",
            )
            .bind(offer_id),
        )
        .await
        .context("Failed to fetch offer")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let attributes: String = row.try_get("attributes")?;
        let attributes: OfferAttributes =
            serde_json::from_str(&attributes).context("Corrupt offer attributes")?;

        Ok(Some(Offer {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            title: row.try_get("title")?,
            attributes,
            created_at: from_millis(row.try_get("created_at")?),
        }))
    }

    /// Delete an offer together with every conversation about it.
    pub async fn delete_offer(&self, offer_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM offers WHERE id = ?")
            .bind(offer_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete offer")?;
        Ok(res.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // Conversations
    // -------------------------------------------------------------------------

    pub async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let row = first_row(
            &self.pool,
            sqlx::query(
                r#"
                SELECT id, offer_id, buyer_id, seller_id, created_at
                FROM conversations
                WHERE id = ?
                "#,
            )
            .bind(id),
        )
        .await
        .context("Failed to fetch conversation")?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Look up the conversation for an exact (offer, buyer, seller) triple.
    pub async fn find_conversation(
        &self,
        offer_id: &str,
        buyer_id: &str,
        seller_id: &str,
    ) -> Result<Option<Conversation>> {
        let row = first_row(
            &self.pool,
            sqlx::query(
                r#"
                SELECT id, offer_id, buyer_id, seller_id, created_at
                FROM conversations
                WHERE offer_id = ? AND buyer_id = ? AND seller_id = ?
                "#,
            )
            .bind(offer_id)
            .bind(buyer_id)
            .bind(seller_id),
        )
        .await
        .context("Failed to look up conversation")?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Insert a conversation for the triple.
    ///
    /// Returns `None` when a row for the same triple already exists, which
    /// includes losing a race against a concurrent insert.
    pub async fn insert_conversation(
        &self,
        offer_id: &str,
        buyer_id: &str,
        seller_id: &str,
    ) -> Result<Option<Conversation>> {
        let row = first_row(
            &self.pool,
            sqlx::query(
                r#"
                INSERT INTO conversations (offer_id, buyer_id, seller_id, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(offer_id, buyer_id, seller_id) DO NOTHING
                RETURNING id, offer_id, buyer_id, seller_id, created_at
                "#,
            )
            .bind(offer_id)
            .bind(buyer_id)
            .bind(seller_id)
            .bind(Utc::now().timestamp_millis()),
        )
        .await
        .context("Failed to insert conversation")?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    /// Every conversation the user takes part in, most recently active first,
    /// each with its last message and the messages the user has yet to read.
    pub async fn list_conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>> {
        // One read transaction, so every summary comes from the same snapshot
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start read transaction")?;

        let rows = sqlx::query(
            r#"
            SELECT id, offer_id, buyer_id, seller_id, created_at
            FROM conversations
            WHERE buyer_id = ? OR seller_id = ?
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to list conversations")?;

        let mut summaries = Vec::with_capacity(rows.len());

        for row in rows {
            let conversation = conversation_from_row(&row)?;

            let last_message = sqlx::query(
                r#"
                SELECT id, conversation_id, sender_id, text, read, created_at
                FROM messages
                WHERE conversation_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(conversation.id)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to fetch last message")?
            .first()
            .map(message_from_row)
            .transpose()?;

            let unread = sqlx::query(
                r#"
                SELECT id, conversation_id, sender_id, text, read, created_at
                FROM messages
                WHERE conversation_id = ? AND sender_id <> ? AND read = 0
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .bind(conversation.id)
            .bind(user_id)
            .fetch_all(&mut *tx)
            .await
            .context("Failed to fetch unread messages")?
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;

            summaries.push(ConversationSummary {
                conversation,
                last_message,
                unread,
            });
        }

        tx.commit().await.context("Failed to end read transaction")?;

        summaries.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then(b.conversation.id.cmp(&a.conversation.id))
        });

        Ok(summaries)
    }

    // -------------------------------------------------------------------------
    // Messages
    // -------------------------------------------------------------------------

    /// Durably append a message from one of the conversation's participants.
    pub async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender_id: &str,
        text: &str,
    ) -> Result<Message> {
        if text.trim().is_empty() {
            return Err(ChatError::validation("message text must not be empty"));
        }
        if sender_id.is_empty() {
            return Err(ChatError::validation("senderId is required"));
        }

        let conversation = self
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::not_found("conversation"))?;

        if !conversation.is_participant(sender_id) {
            return Err(ChatError::validation(
                "sender is not a participant of this conversation",
            ));
        }

        // created_at never goes below the newest message already in the
        // conversation, so timestamp order and insertion order agree.
        let row = first_row(
            &self.pool,
            sqlx::query(
                r#"
                INSERT INTO messages (conversation_id, sender_id, text, read, created_at)
                SELECT ?, ?, ?, 0, MAX(?, COALESCE(
                    (SELECT MAX(created_at) FROM messages WHERE conversation_id = ?), 0))
                RETURNING id, conversation_id, sender_id, text, read, created_at
                "#,
            )
            .bind(conversation_id)
            .bind(sender_id)
            .bind(text)
            .bind(Utc::now().timestamp_millis())
            .bind(conversation_id),
        )
        .await
        .context("Failed to save message")?
        .context("Message insert returned no row")?;

        let message = message_from_row(&row)?;
        debug!(
            "Stored message {} in conversation {}",
            message.id, conversation_id
        );
        Ok(message)
    }

    /// Messages of a conversation, oldest first.
    pub async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, sender_id, text, read, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages")?;

        rows.iter().map(message_from_row).collect()
    }

    /// Flip `read` to true for the given messages of a conversation.
    ///
    /// Ids that belong elsewhere or are already read are left untouched. The
    /// returned count is the number of messages that actually transitioned.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
    ) -> Result<u64> {
        if message_ids.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE messages SET read = 1 WHERE read = 0 AND conversation_id = ",
        );
        qb.push_bind(conversation_id);
        push_id_filter(&mut qb, message_ids);

        let res = qb
            .build()
            .execute(&self.pool)
            .await
            .context("Failed to mark messages read")?;

        Ok(res.rows_affected())
    }

    /// Ids of unread messages in a conversation that were not sent by `reader_id`,
    /// optionally restricted to `only`.
    pub async fn unread_ids_from_others(
        &self,
        conversation_id: ConversationId,
        reader_id: &str,
        only: Option<&[MessageId]>,
    ) -> Result<Vec<MessageId>> {
        if matches!(only, Some(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id FROM messages WHERE read = 0 AND conversation_id = ",
        );
        qb.push_bind(conversation_id);
        qb.push(" AND sender_id <> ");
        qb.push_bind(reader_id);
        if let Some(ids) = only {
            push_id_filter(&mut qb, ids);
        }
        qb.push(" ORDER BY created_at ASC, id ASC");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch unread message ids")?;

        rows.iter()
            .map(|row| row.try_get::<MessageId, _>("id").map_err(ChatError::from))
            .collect()
    }

    /// Unread messages from the counterpart in one conversation.
    pub async fn unread_count(&self, conversation_id: ConversationId, user_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE conversation_id = ? AND sender_id <> ? AND read = 0
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count unread messages")?
        .into_iter()
        .next()
        .unwrap_or(0);

        Ok(count)
    }

    /// Aggregate unread count across all of a user's conversations.
    pub async fn unread_count_for_user(&self, user_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM messages m
            JOIN conversations c ON c.id = m.conversation_id
            WHERE (c.buyer_id = ? OR c.seller_id = ?)
              AND m.sender_id <> ?
              AND m.read = 0
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count unread messages")?
        .into_iter()
        .next()
        .unwrap_or(0);

        Ok(count)
    }
}

/// Steps `query` to completion and keeps its first row.
///
/// A statement left mid-result keeps its implicit transaction open on the
/// pooled connection, hiding writes from (or to) every other connection.
async fn first_row<'q>(
    pool: &SqlitePool,
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
) -> sqlx::Result<Option<SqliteRow>> {
    Ok(query.fetch_all(pool).await?.into_iter().next())
}

fn push_id_filter(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[MessageId]) {
    qb.push(" AND id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        offer_id: row.try_get("offer_id")?,
        buyer_id: row.try_get("buyer_id")?,
        seller_id: row.try_get("seller_id")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        text: row.try_get("text")?,
        read: row.try_get("read")?,
        created_at: from_millis(row.try_get("created_at")?),
    })
}
