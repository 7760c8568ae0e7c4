//! Realtime wire format.
//!
//! Every WebSocket text frame carries one JSON envelope. Client frames name an
//! event, carry its payload under `data` and may ask for an acknowledgement by
//! setting `ack`. Server frames are [`ServerEvent`]s.

use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, Message, UserId};

pub const EVENT_JOIN: &str = "conversation:join";
pub const EVENT_SEND: &str = "message:send";
pub const EVENT_TYPING: &str = "typing";
pub const EVENT_PING: &str = "ping";

/// Client → server envelope.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl ClientFrame {
    pub fn new<T: Serialize>(event: &str, data: &T, ack: Option<u64>) -> serde_json::Result<Self> {
        Ok(Self {
            event: event.to_string(),
            data: serde_json::to_value(data)?,
            ack,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default)]
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(default)]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub is_typing: bool,
}

/// Reply to a client frame that carried an `ack` id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AckPayload {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckPayload {
    pub fn ok(id: u64, message: Option<Message>) -> Self {
        Self {
            id,
            ok: true,
            message,
            error: None,
        }
    }

    pub fn failed(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Server → client envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(Message),
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    #[serde(rename = "ack")]
    Ack(AckPayload),
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "pong")]
    Pong,
}
