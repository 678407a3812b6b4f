use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

/// Errors surfaced by the conversation service.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Missing or malformed input (empty text, absent offer id, ...)
    #[error("{0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    /// The request is well formed but not allowed, e.g. messaging yourself.
    #[error("{0}")]
    InvalidOperation(String),

    /// Store or relay failure not otherwise classified.
    #[error("server error: {0:#}")]
    Server(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Stable identifier sent alongside the message in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::Unauthorized => "unauthorized",
            ChatError::NotFound(_) => "not_found",
            ChatError::InvalidOperation(_) => "invalid_operation",
            ChatError::Server(_) => "server",
        }
    }

    /// Rebuild an error from a response status and its `{kind, error}` body.
    pub fn from_response(status: u16, kind: Option<&str>, message: String) -> Self {
        match (status, kind) {
            (400, Some("invalid_operation")) => ChatError::InvalidOperation(message),
            (400, _) => ChatError::Validation(message),
            (401, _) => ChatError::Unauthorized,
            (404, _) => ChatError::NotFound(
                message
                    .strip_suffix(" not found")
                    .unwrap_or(&message)
                    .to_string(),
            ),
            _ => ChatError::Server(anyhow::anyhow!("HTTP {}: {}", status, message)),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) | ChatError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(e: sqlx::Error) -> Self {
        ChatError::Server(e.into())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Internal details stay in the log
            ChatError::Server(e) => {
                error!("Request failed: {:#}", e);
                "server error".to_string()
            }
            other => other.to_string(),
        };

        let body = serde_json::json!({ "error": message, "kind": self.kind() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        assert_eq!(ChatError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ChatError::InvalidOperation("cannot message yourself".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ChatError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ChatError::not_found("offer").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ChatError::Server(anyhow::anyhow!("disk full")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn response_round_trips_the_variant() {
        let err = ChatError::from_response(400, Some("invalid_operation"), "cannot message yourself".into());
        assert!(matches!(err, ChatError::InvalidOperation(m) if m == "cannot message yourself"));

        let err = ChatError::from_response(404, Some("not_found"), "offer not found".into());
        assert!(matches!(err, ChatError::NotFound(m) if m == "offer"));

        assert!(matches!(ChatError::from_response(401, None, String::new()), ChatError::Unauthorized));
        assert!(matches!(ChatError::from_response(502, None, "bad gateway".into()), ChatError::Server(_)));
    }

    #[test]
    fn not_found_message_names_the_resource() {
        assert_eq!(ChatError::not_found("conversation").to_string(), "conversation not found");
    }
}
