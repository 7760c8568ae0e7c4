//! Client-side chat state: a reactive cache of conversations, messages and
//! typing indicators, kept in sync over HTTP and the realtime channel.
//!
//! `ChatClient` connects lazily. The first call to [`ChatClient::ensure_connected`]
//! (made implicitly by the operations that need the channel) spawns one
//! connection task, which reconnects with backoff and re-joins every room the
//! client had joined. Observers follow changes through [`ChatClient::subscribe`].

mod connection;
pub mod identity;
pub mod state;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use self::connection::{Connection, Outgoing};
pub use self::state::ChatState;
use crate::protocol::{AckPayload, ClientFrame, EVENT_JOIN, EVENT_SEND, EVENT_TYPING, JoinPayload, TypingPayload};
use crate::types::{
    Conversation, DEFAULT_MESSAGE_LIMIT, Items, Message, SHARED_ROOM_KEY, SHARED_ROOM_NAME,
    SendMessageRequest, UserId,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("identity store error: {0}")]
    Identity(#[from] std::io::Error),
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("realtime channel closed before acknowledging")]
    Disconnected,
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("message text is empty")]
    EmptyMessage,
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the chat server, e.g. `http://localhost:5000`.
    pub api_base: String,
    pub identity_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://localhost:5000")
    }
}

impl ClientConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            identity_path: identity::default_identity_path(),
        }
    }

    pub fn with_identity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_path = path.into();
        self
    }

    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.api_base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.api_base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.api_base.clone()
        };
        format!("{}/api/ws", base)
    }

    fn chat_url(&self, path: &str) -> String {
        format!("{}/api/chat{}", self.api_base, path)
    }
}

pub struct ChatClient {
    config: ClientConfig,
    http: reqwest::Client,
    user_id: UserId,
    state: Arc<watch::Sender<ChatState>>,
    connection: Mutex<Option<Connection>>,
    next_ack: AtomicU64,
}

impl ChatClient {
    /// Loads (or creates) the persisted identity. Does not touch the network.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let user_id = identity::load_or_create(&config.identity_path)?;
        Ok(Self::with_user_id(config, user_id))
    }

    pub fn with_user_id(config: ClientConfig, user_id: impl Into<UserId>) -> Self {
        let (state, _) = watch::channel(ChatState::default());
        Self {
            config,
            http: reqwest::Client::new(),
            user_id: user_id.into(),
            state: Arc::new(state),
            connection: Mutex::new(None),
            next_ack: AtomicU64::new(1),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    /// Starts the realtime connection task unless one is already running.
    /// After [`ChatClient::shutdown`] the next call starts a fresh one.
    /// Must be called from within a Tokio runtime.
    pub fn ensure_connected(&self) {
        self.outgoing();
    }

    fn slot(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outgoing(&self) -> mpsc::UnboundedSender<Outgoing> {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(connection) if !connection.task.is_finished() => connection.out_tx.clone(),
            _ => {
                let connection =
                    connection::spawn(self.config.ws_url(), self.user_id.clone(), self.state.clone());
                let out_tx = connection.out_tx.clone();
                *slot = Some(connection);
                out_tx
            }
        }
    }

    /// Resolves once the realtime channel is up.
    pub async fn wait_until_connected(&self) {
        self.ensure_connected();
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|s| s.connected).await;
    }

    /// Refreshes the conversation list. Failures leave an empty list.
    pub async fn fetch_conversations(&self) -> Vec<Conversation> {
        let query = [("userId", self.user_id.as_str())];
        let items = match self.get_json::<Items<Conversation>>("/conversations", &query).await {
            Ok(page) => page.items,
            Err(e) => {
                log::warn!("Failed to fetch conversations: {}", e);
                Vec::new()
            }
        };
        self.state.send_modify(|s| s.replace_conversations(items.clone()));
        items
    }

    /// Subscribes to a conversation, makes it active and seeds its recent history.
    pub async fn join_conversation(&self, conversation_id: &str) {
        self.ensure_connected();
        self.state.send_modify(|s| {
            s.joined.insert(conversation_id.to_string());
            s.active_id = Some(conversation_id.to_string());
        });

        let payload = JoinPayload {
            conversation_id: conversation_id.to_string(),
            user_id: Some(self.user_id.clone()),
        };
        let connected = self.state.borrow().connected;
        if connected {
            // Best effort: the connection task re-joins after any reconnect.
            if let Err(e) = self.emit_with_ack(EVENT_JOIN, &payload).await {
                log::warn!("Join of {} not acknowledged: {}", conversation_id, e);
            }
        }

        let limit = DEFAULT_MESSAGE_LIMIT.to_string();
        let query = [("conversationId", conversation_id), ("limit", limit.as_str())];
        let history = match self.get_json::<Items<Message>>("/messages", &query).await {
            Ok(page) => page.items,
            Err(e) => {
                log::warn!("Failed to fetch history for {}: {}", conversation_id, e);
                Vec::new()
            }
        };
        self.state
            .send_modify(|s| s.seed_history(conversation_id, history));
    }

    /// Sends to the active conversation: over the realtime channel when it is
    /// up, otherwise over HTTP with the stored message merged locally.
    pub async fn send_message(&self, text: &str) -> Result<Message, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let conversation_id = self
            .state
            .borrow()
            .active_id
            .clone()
            .ok_or(ClientError::NoActiveConversation)?;

        let request = SendMessageRequest {
            conversation_id,
            sender_id: self.user_id.clone(),
            text: text.to_string(),
        };

        let connected = self.state.borrow().connected;
        if connected {
            let ack = self.emit_with_ack(EVENT_SEND, &request).await?;
            return match (ack.ok, ack.message) {
                (true, Some(message)) => Ok(message),
                _ => Err(ClientError::Rejected(
                    ack.error.unwrap_or_else(|| "no message in acknowledgement".to_string()),
                )),
            };
        }

        let message: Message = self.post_json("/messages", &request).await?;
        self.state.send_modify(|s| {
            s.merge_message(message.clone());
        });
        Ok(message)
    }

    /// Emits a typing indicator for the active conversation. Silently skipped
    /// while disconnected or with no active conversation.
    pub fn set_typing(&self, is_typing: bool) {
        let (active, connected) = {
            let state = self.state.borrow();
            (state.active_id.clone(), state.connected)
        };
        let (Some(conversation_id), true) = (active, connected) else {
            return;
        };
        let payload = TypingPayload {
            conversation_id,
            user_id: self.user_id.clone(),
            is_typing,
        };
        if let Err(e) = self.emit(EVENT_TYPING, &payload, None) {
            log::debug!("Typing indicator dropped: {}", e);
        }
    }

    /// Creates a two-party conversation with `peer_id`, refreshes the list and joins it.
    pub async fn create_direct_conversation(
        &self,
        peer_id: &str,
        name: Option<&str>,
    ) -> Result<Conversation, ClientError> {
        let mut body = json!({ "participantIds": [self.user_id, peer_id.trim()] });
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            body["name"] = json!(name);
        }
        let convo: Conversation = self.post_json("/conversations", &body).await?;
        self.fetch_conversations().await;
        self.join_conversation(&convo.id).await;
        Ok(convo)
    }

    /// Joins the shared room for `key`. Falls back to the GET variant on a 404
    /// from servers that only expose it that way.
    pub async fn join_shared_room(
        &self,
        key: Option<&str>,
        name: Option<&str>,
    ) -> Result<Conversation, ClientError> {
        let key = key.unwrap_or(SHARED_ROOM_KEY);
        let name = name.unwrap_or(SHARED_ROOM_NAME);
        let body = json!({ "key": key, "name": name, "userId": self.user_id });

        let convo: Conversation = match self.post_json("/rooms/shared", &body).await {
            Ok(convo) => convo,
            Err(e) if e.is_not_found() => {
                let query = [("key", key), ("name", name), ("userId", self.user_id.as_str())];
                self.get_json("/rooms/shared", &query).await?
            }
            Err(e) => return Err(e),
        };
        self.fetch_conversations().await;
        self.join_conversation(&convo.id).await;
        Ok(convo)
    }

    /// Stops the connection task. The client stays usable over HTTP, and a
    /// later [`ChatClient::ensure_connected`] reconnects.
    pub fn shutdown(&self) {
        if let Some(connection) = self.slot().take() {
            connection.task.abort();
        }
        self.state.send_modify(|s| {
            s.connected = false;
            s.typing.clear();
        });
    }

    fn emit<T: Serialize>(
        &self,
        event: &str,
        data: &T,
        ack: Option<(u64, oneshot::Sender<AckPayload>)>,
    ) -> Result<(), ClientError> {
        let out_tx = self.outgoing();
        let (ack_id, ack_tx) = match ack {
            Some((id, tx)) => (Some(id), Some(tx)),
            None => (None, None),
        };
        let frame = ClientFrame::new(event, data, ack_id)
            .map_err(|e| ClientError::Rejected(e.to_string()))?;
        out_tx
            .send(Outgoing { frame, ack_tx })
            .map_err(|_| ClientError::Disconnected)
    }

    async fn emit_with_ack<T: Serialize>(&self, event: &str, data: &T) -> Result<AckPayload, ClientError> {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.emit(event, data, Some((id, tx)))?;
        let ack = rx.await.map_err(|_| ClientError::Disconnected)?;
        if !ack.ok {
            return Err(ClientError::Rejected(
                ack.error.unwrap_or_else(|| "rejected".to_string()),
            ));
        }
        Ok(ack)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, ClientError> {
        let response = self
            .http
            .get(self.config.chat_url(path))
            .query(query)
            .send()
            .await?;
        decode(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        let response = self
            .http
            .post(self.config.chat_url(path))
            .json(body)
            .send()
            .await?;
        decode(response).await
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        let slot = self.connection.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(connection) = slot.take() {
            connection.task.abort();
        }
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ClientError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}
