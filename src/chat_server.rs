use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::ChatError;
use crate::protocol::{ServerEvent, TypingPayload};
use crate::store::ConversationRepository;
use crate::types::{Conversation, ConversationId, Message, SendMessageRequest, UserId};

pub type ConnId = Uuid;

enum Command {
    Connect {
        conn_id: ConnId,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
    },
    Disconnect {
        conn_id: ConnId,
    },
    Join {
        conn_id: ConnId,
        conversation_id: ConversationId,
        user_id: Option<UserId>,
        res_tx: oneshot::Sender<()>,
    },
    SendMessage {
        request: SendMessageRequest,
        res_tx: oneshot::Sender<Result<Message, ChatError>>,
    },
    Typing {
        conn_id: ConnId,
        payload: TypingPayload,
    },
    CreateConversation {
        participant_ids: Vec<UserId>,
        name: Option<String>,
        res_tx: oneshot::Sender<Result<Conversation, ChatError>>,
    },
    ListConversations {
        user_id: UserId,
        res_tx: oneshot::Sender<Result<Vec<Conversation>, ChatError>>,
    },
    GetMessages {
        conversation_id: ConversationId,
        limit: Option<usize>,
        res_tx: oneshot::Sender<Result<Vec<Message>, ChatError>>,
    },
    UpsertShared {
        key: String,
        name: String,
        user_id: Option<UserId>,
        res_tx: oneshot::Sender<Result<Conversation, ChatError>>,
    },
    StoreKind {
        res_tx: oneshot::Sender<&'static str>,
    },
    ConnectionCount {
        res_tx: oneshot::Sender<usize>,
    },
}

/// Single owner of the repository and of room membership.
///
/// HTTP handlers and WebSocket sessions talk to it only through a
/// [`ChatServerHandle`]. Commands are processed one at a time, so a message
/// append and its `message:new` broadcast finish before the next command runs.
pub struct ChatServer<R> {
    repo: R,
    sessions: HashMap<ConnId, mpsc::UnboundedSender<ServerEvent>>,
    rooms: HashMap<ConversationId, HashSet<ConnId>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl<R: ConversationRepository> ChatServer<R> {
    pub fn new(repo: R) -> (Self, ChatServerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();

        (
            Self {
                repo,
                sessions: HashMap::new(),
                rooms: HashMap::new(),
                cmd_rx,
            },
            ChatServerHandle { cmd_tx },
        )
    }

    pub async fn run(mut self) {
        while let Some(command) = self.cmd_rx.recv().await {
            self.handle(command).await;
        }
        log::info!("Chat server stopped: all handles dropped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { conn_id, event_tx } => {
                log::debug!("Channel connected: {}", conn_id);
                self.sessions.insert(conn_id, event_tx);
            }
            Command::Disconnect { conn_id } => {
                log::debug!("Channel disconnected: {}", conn_id);
                self.sessions.remove(&conn_id);
                self.rooms.retain(|_, members| {
                    members.remove(&conn_id);
                    !members.is_empty()
                });
            }
            Command::Join {
                conn_id,
                conversation_id,
                user_id,
                res_tx,
            } => {
                if let Some(user_id) = user_id.as_deref() {
                    if let Err(e) = self
                        .repo
                        .add_participant(&conversation_id, Some(user_id))
                        .await
                    {
                        log::warn!(
                            "Join {} by {}: participant not recorded: {}",
                            conversation_id,
                            user_id,
                            e
                        );
                    }
                }
                if self.sessions.contains_key(&conn_id) {
                    self.rooms
                        .entry(conversation_id)
                        .or_default()
                        .insert(conn_id);
                }
                let _ = res_tx.send(());
            }
            Command::SendMessage { request, res_tx } => {
                let result = self
                    .repo
                    .add_message(&request.conversation_id, &request.sender_id, &request.text)
                    .await;
                if let Ok(message) = &result {
                    self.broadcast(
                        &message.conversation_id,
                        ServerEvent::MessageNew(message.clone()),
                        None,
                    );
                }
                let _ = res_tx.send(result);
            }
            Command::Typing { conn_id, payload } => {
                if payload.conversation_id.is_empty() || payload.user_id.is_empty() {
                    log::debug!("Dropping typing event without conversationId/userId");
                    return;
                }
                let conversation_id = payload.conversation_id.clone();
                self.broadcast(&conversation_id, ServerEvent::Typing(payload), Some(conn_id));
            }
            Command::CreateConversation {
                participant_ids,
                name,
                res_tx,
            } => {
                let _ = res_tx.send(self.repo.create_conversation(participant_ids, name).await);
            }
            Command::ListConversations { user_id, res_tx } => {
                let _ = res_tx.send(self.repo.list_conversations(&user_id).await);
            }
            Command::GetMessages {
                conversation_id,
                limit,
                res_tx,
            } => {
                let _ = res_tx.send(self.repo.get_messages(&conversation_id, limit).await);
            }
            Command::UpsertShared {
                key,
                name,
                user_id,
                res_tx,
            } => {
                let result = self
                    .repo
                    .upsert_shared_conversation(&key, &name, user_id.as_deref())
                    .await;
                let _ = res_tx.send(result);
            }
            Command::StoreKind { res_tx } => {
                let _ = res_tx.send(self.repo.kind());
            }
            Command::ConnectionCount { res_tx } => {
                self.prune_closed();
                let _ = res_tx.send(self.sessions.len());
            }
        }
    }

    /// Forgets channels whose session task ended without a `Disconnect`.
    fn prune_closed(&mut self) {
        self.sessions.retain(|conn_id, tx| {
            let open = !tx.is_closed();
            if !open {
                log::debug!("Pruning stale channel {}", conn_id);
            }
            open
        });
        let sessions = &self.sessions;
        self.rooms.retain(|_, members| {
            members.retain(|id| sessions.contains_key(id));
            !members.is_empty()
        });
    }

    fn broadcast(&self, conversation_id: &str, event: ServerEvent, skip: Option<ConnId>) {
        let Some(members) = self.rooms.get(conversation_id) else {
            return;
        };
        for conn_id in members.iter().filter(|id| Some(**id) != skip) {
            if let Some(tx) = self.sessions.get(conn_id) {
                if tx.send(event.clone()).is_err() {
                    log::debug!("Channel {} went away before delivery", conn_id);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ChatServerHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ChatServerHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ChatError> {
        let (res_tx, res_rx) = oneshot::channel();

        self.cmd_tx
            .send(command(res_tx))
            .map_err(|_| ChatError::GatewayUnavailable)?;

        res_rx.await.map_err(|_| ChatError::GatewayUnavailable)
    }

    /// Registers a channel; events for rooms it joins are pushed into `event_tx`.
    pub fn connect(&self, event_tx: mpsc::UnboundedSender<ServerEvent>) -> Result<ConnId, ChatError> {
        let conn_id = Uuid::new_v4();
        self.cmd_tx
            .send(Command::Connect { conn_id, event_tx })
            .map_err(|_| ChatError::GatewayUnavailable)?;
        Ok(conn_id)
    }

    pub fn disconnect(&self, conn_id: ConnId) -> Result<(), ChatError> {
        self.cmd_tx
            .send(Command::Disconnect { conn_id })
            .map_err(|_| ChatError::GatewayUnavailable)
    }

    /// Subscribes the channel to a room. Recording the user as a participant is
    /// best-effort and never fails the join.
    pub async fn join(
        &self,
        conn_id: ConnId,
        conversation_id: ConversationId,
        user_id: Option<UserId>,
    ) -> Result<(), ChatError> {
        self.request(|res_tx| Command::Join {
            conn_id,
            conversation_id,
            user_id,
            res_tx,
        })
        .await
    }

    /// Appends a message and broadcasts it to the conversation's room.
    pub async fn send_message(&self, request: SendMessageRequest) -> Result<Message, ChatError> {
        self.request(|res_tx| Command::SendMessage { request, res_tx })
            .await?
    }

    pub fn typing(&self, conn_id: ConnId, payload: TypingPayload) -> Result<(), ChatError> {
        self.cmd_tx
            .send(Command::Typing { conn_id, payload })
            .map_err(|_| ChatError::GatewayUnavailable)
    }

    pub async fn create_conversation(
        &self,
        participant_ids: Vec<UserId>,
        name: Option<String>,
    ) -> Result<Conversation, ChatError> {
        self.request(|res_tx| Command::CreateConversation {
            participant_ids,
            name,
            res_tx,
        })
        .await?
    }

    pub async fn list_conversations(&self, user_id: UserId) -> Result<Vec<Conversation>, ChatError> {
        self.request(|res_tx| Command::ListConversations { user_id, res_tx })
            .await?
    }

    pub async fn get_messages(
        &self,
        conversation_id: ConversationId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ChatError> {
        self.request(|res_tx| Command::GetMessages {
            conversation_id,
            limit,
            res_tx,
        })
        .await?
    }

    pub async fn upsert_shared_conversation(
        &self,
        key: String,
        name: String,
        user_id: Option<UserId>,
    ) -> Result<Conversation, ChatError> {
        self.request(|res_tx| Command::UpsertShared {
            key,
            name,
            user_id,
            res_tx,
        })
        .await?
    }

    pub async fn store_kind(&self) -> Result<&'static str, ChatError> {
        self.request(|res_tx| Command::StoreKind { res_tx }).await
    }

    /// Number of live realtime channels.
    pub async fn connection_count(&self) -> Result<usize, ChatError> {
        self.request(|res_tx| Command::ConnectionCount { res_tx }).await
    }
}
