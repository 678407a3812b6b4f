use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::ChatError;

/// Header carrying the authenticated user id. Sessions are issued and checked
/// by the auth layer in front of this service, which sets it on every request.
pub const SESSION_HEADER: &str = "x-user-id";

/// The user of the current session. Rejects with 401 when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser(pub String);

impl SessionUser {
    pub fn id(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for SessionUser
where
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| SessionUser(v.to_string()))
            .ok_or(ChatError::Unauthorized)
    }
}
