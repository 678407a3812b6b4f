use std::{collections::HashMap, convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Json, Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::Channel;
use crate::chat::{Conversation, ConversationId, ConversationSummary, Message, MessageId};
use crate::error::{ChatError, Result};
use crate::http::session::SessionUser;
use crate::manager::Manager;

/// First SSE event of every stream, sent once the relay subscription is live.
pub const SUBSCRIBED_EVENT: &str = "subscribed";

// -----------------------------------------------------------------------------
// Request / response bodies
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub text: Option<String>,
    pub sender_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationBody {
    pub offer_id: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadBody {
    pub message_ids: Option<Vec<MessageId>>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct AppState {
    pub manager: Arc<Manager>,
}

pub fn router(manager: Arc<Manager>) -> Router {
    let state = Arc::new(AppState { manager });

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/conversations/unread", get(unread_count))
        .route(
            "/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/conversations/:id/read", post(mark_read))
        .route("/channels/:channel/events", get(channel_events))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ChatError::validation(rejection.body_text()))
}

/// Bodies that may be left out entirely. Anything present must parse.
fn optional_body<T: DeserializeOwned + Default>(raw: &Bytes) -> Result<T> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(raw)
        .map_err(|e| ChatError::validation(format!("Failed to parse the request body: {}", e)))
}

fn required(field: Option<String>, name: &str) -> Result<String> {
    field
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ChatError::validation(format!("{} is required", name)))
}

// -----------------------------------------------------------------------------
// Handlers
// -----------------------------------------------------------------------------

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
) -> Result<Json<Vec<ConversationSummary>>> {
    let summaries = state.manager.list_conversations(session.id()).await?;
    Ok(Json(summaries))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
    payload: std::result::Result<Json<CreateConversationBody>, JsonRejection>,
) -> Result<Json<Conversation>> {
    let offer_id = required(body(payload)?.offer_id, "offerId")?;
    let conversation = state
        .manager
        .resolve_conversation(session.id(), &offer_id)
        .await?;
    Ok(Json(conversation))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
) -> Result<Json<CountResponse>> {
    let count = state.manager.unread_count(session.id()).await?;
    Ok(Json(CountResponse { count }))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
    Path(id): Path<ConversationId>,
) -> Result<Json<Vec<Message>>> {
    let messages = state.manager.list_messages(id, session.id()).await?;
    Ok(Json(messages))
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
    Path(id): Path<ConversationId>,
    payload: std::result::Result<Json<SendMessageBody>, JsonRejection>,
) -> Result<impl IntoResponse> {
    let payload = body(payload)?;
    let text = required(payload.text, "text")?;
    let sender_id = required(payload.sender_id, "senderId")?;
    if sender_id != session.id() {
        return Err(ChatError::validation("senderId does not match the session user"));
    }

    let message = state.manager.send_message(id, &sender_id, &text).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
    Path(id): Path<ConversationId>,
    raw: Bytes,
) -> Result<Json<CountResponse>> {
    let only = optional_body::<MarkReadBody>(&raw)?.message_ids;
    let count = state
        .manager
        .mark_read(id, session.id(), only.as_deref())
        .await?;
    Ok(Json(CountResponse { count }))
}

async fn channel_events(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
    Path(channel): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>> {
    let channel: Channel = channel
        .parse()
        .map_err(|e: anyhow::Error| ChatError::validation(format!("{:#}", e)))?;

    // Create a new receiver for this connection
    let mut rx = state.manager.subscribe(channel, session.id()).await?;
    let connection = format!("sse_{}", Uuid::new_v4().simple());
    info!("{} subscribed {} to {}", connection, session.id(), channel);

    let manager = state.manager.clone();
    let user = session.0;

    let stream = async_stream::stream! {
        yield Ok(SseEvent::default().event(SUBSCRIBED_EVENT).data(channel.to_string()));

        // Participants never change, so membership is looked up once per conversation
        let mut members: HashMap<ConversationId, bool> = HashMap::new();

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if channel == Channel::Global {
                        let id = event.conversation_id();
                        let cached = members.get(&id).copied();
                        let visible = match cached {
                            Some(visible) => visible,
                            None => match manager.is_participant(id, &user).await {
                                Ok(visible) => *members.entry(id).or_insert(visible),
                                Err(e) => {
                                    warn!("{} could not check conversation {}: {}", connection, id, e);
                                    continue;
                                }
                            },
                        };
                        if !visible {
                            continue;
                        }
                    }
                    yield Ok(SseEvent::default()
                        .event(event.name())
                        .data(event.payload().to_string()));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Delivery is at most once; the client catches up on its next fetch
                    warn!("{} lagged on {}, {} event(s) dropped", connection, channel, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
        debug!("{} closed", connection);
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
