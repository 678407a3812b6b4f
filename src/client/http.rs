use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header::ACCEPT, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{Channel, Event};
use crate::chat::{Conversation, ConversationId, ConversationSummary, Message, MessageId};
use crate::client::backend::ChatBackend;
use crate::client::subscription::{SseDecoder, SseFrame, Subscription};
use crate::error::{ChatError, Result};
use crate::http::server::{
    CountResponse, CreateConversationBody, MarkReadBody, SendMessageBody, SUBSCRIBED_EVENT,
};
use crate::http::session::SESSION_HEADER;

const EVENT_BUFFER: usize = 64;

/// Backend speaking to a remote server over its HTTP surface, with channel
/// subscriptions carried by server-sent events.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    user_id: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> anyhow::Result<Self> {
        // No overall timeout: event streams stay open for as long as the view does
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header(SESSION_HEADER, &self.user_id)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = check(request.send().await.context("Request failed")?).await?;
        let body = response
            .json::<T>()
            .await
            .context("Invalid response body")?;
        Ok(body)
    }
}

/// Turn a non-success response into the matching [`ChatError`].
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.json::<serde_json::Value>().await.unwrap_or_default();
    let message = body["error"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| status.to_string());
    Err(ChatError::from_response(
        status.as_u16(),
        body["kind"].as_str(),
        message,
    ))
}

async fn forward(channel: Channel, frame: SseFrame, tx: &mpsc::Sender<Event>) -> bool {
    match Event::decode(channel, &frame.event, &frame.data) {
        Ok(event) => tx.send(event).await.is_ok(),
        Err(e) => {
            warn!("Ignoring event on {}: {:#}", channel, e);
            true
        }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn resolve_conversation(&self, offer_id: &str) -> Result<Conversation> {
        let body = CreateConversationBody {
            offer_id: Some(offer_id.to_string()),
        };
        self.send(self.request(Method::POST, "/conversations").json(&body))
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.send(self.request(Method::GET, "/conversations")).await
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let path = format!("/conversations/{}/messages", conversation_id);
        self.send(self.request(Method::GET, &path)).await
    }

    async fn send_message(&self, conversation_id: ConversationId, text: &str) -> Result<Message> {
        let path = format!("/conversations/{}/messages", conversation_id);
        let body = SendMessageBody {
            text: Some(text.to_string()),
            sender_id: Some(self.user_id.clone()),
        };
        self.send(self.request(Method::POST, &path).json(&body))
            .await
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        only: Option<&[MessageId]>,
    ) -> Result<u64> {
        let path = format!("/conversations/{}/read", conversation_id);
        let body = MarkReadBody {
            message_ids: only.map(|ids| ids.to_vec()),
        };
        let response: CountResponse = self
            .send(self.request(Method::POST, &path).json(&body))
            .await?;
        Ok(response.count)
    }

    async fn unread_count(&self) -> Result<u64> {
        let response: CountResponse = self
            .send(self.request(Method::GET, "/conversations/unread"))
            .await?;
        Ok(response.count)
    }

    async fn subscribe(&self, channel: Channel) -> Result<Subscription> {
        let path = format!("/channels/{}/events", channel);
        let response = self
            .request(Method::GET, &path)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .context("Failed to open event stream")?;
        let mut stream = Box::pin(check(response).await?.bytes_stream());
        let mut decoder = SseDecoder::new();

        // Only hand the subscription out once the server confirms it is live
        let pending = loop {
            let chunk = stream
                .next()
                .await
                .ok_or_else(|| anyhow!("Event stream for {} closed early", channel))?
                .context("Failed to read event stream")?;
            let frames = decoder.push(&chunk);
            if let Some(pos) = frames.iter().position(|f| f.event == SUBSCRIBED_EVENT) {
                break frames.into_iter().skip(pos + 1).collect::<Vec<_>>();
            }
        };
        debug!("Subscribed to {} over SSE", channel);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(async move {
            for frame in pending {
                if !forward(channel, frame, &tx).await {
                    return;
                }
            }
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("Event stream for {} failed: {}", channel, e);
                        break;
                    }
                };
                for frame in decoder.push(&chunk) {
                    if !forward(channel, frame, &tx).await {
                        return;
                    }
                }
            }
            debug!("Event stream for {} ended", channel);
        });

        Ok(Subscription::forwarded(channel, rx, task))
    }
}
