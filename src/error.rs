use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure conditions shared by the store, the gateway and the HTTP layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Chat server unavailable")]
    GatewayUnavailable,
}

impl ChatError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn not_found(conversation_id: impl Into<String>) -> Self {
        Self::ConversationNotFound(conversation_id.into())
    }

    pub fn profile_not_found(profile_id: impl Into<String>) -> Self {
        Self::ProfileNotFound(profile_id.into())
    }
}

impl From<mongodb::error::Error> for ChatError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::PersistenceUnavailable(err.to_string())
    }
}

/// JSON body returned for every failed HTTP request.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}

impl ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::ConversationNotFound(_) | ChatError::ProfileNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ChatError::PersistenceUnavailable(_) | ChatError::GatewayUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}
