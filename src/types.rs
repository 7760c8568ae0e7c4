use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub type UserId = String;
pub type ConversationId = String;

pub const DEFAULT_MESSAGE_LIMIT: usize = 50;
pub const SHARED_ROOM_KEY: &str = "shared-demo";
pub const SHARED_ROOM_NAME: &str = "Shared Demo";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub name: Option<String>,
    pub is_group: bool,
    pub participant_ids: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|id| id == user_id)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// `{ "items": [...] }` envelope used by the listing endpoints.
#[derive(Serialize, Deserialize, Debug)]
pub struct Items<T> {
    pub items: Vec<T>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListConversationsQuery {
    pub user_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub participant_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CreateConversationRequest {
    pub fn validate(&self) -> Result<(), ChatError> {
        let distinct = crate::utils::dedupe_ids(
            self.participant_ids
                .iter()
                .filter(|id| !id.trim().is_empty())
                .cloned(),
        );
        if distinct.len() < 2 {
            return Err(ChatError::invalid("participantIds (>=2) required"));
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub conversation_id: Option<String>,
    pub limit: Option<i64>,
}

impl MessagesQuery {
    /// `None` means the whole history.
    pub fn effective_limit(&self) -> Option<usize> {
        match self.limit {
            None => Some(DEFAULT_MESSAGE_LIMIT),
            Some(n) if n <= 0 => None,
            Some(n) => Some(n as usize),
        }
    }
}

/// Body of `POST /messages` and payload of the `message:send` event.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub conversation_id: ConversationId,
    #[serde(default, alias = "userId")]
    pub sender_id: UserId,
    #[serde(default)]
    pub text: String,
}

impl SendMessageRequest {
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.conversation_id.trim().is_empty()
            || self.sender_id.trim().is_empty()
            || self.text.trim().is_empty()
        {
            return Err(ChatError::invalid(
                "conversationId, senderId, text required",
            ));
        }
        Ok(())
    }
}

/// Parameters for joining (or creating) a room addressed by a well-known key.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SharedRoomRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl SharedRoomRequest {
    pub fn key(&self) -> String {
        crate::utils::non_empty(self.key.clone()).unwrap_or_else(|| SHARED_ROOM_KEY.to_string())
    }

    pub fn name(&self) -> String {
        crate::utils::non_empty(self.name.clone())
            .unwrap_or_else(|| SHARED_ROOM_NAME.to_string())
    }

    pub fn user_id(&self) -> Option<UserId> {
        crate::utils::non_empty(self.user_id.clone())
    }
}
