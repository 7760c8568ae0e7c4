use std::collections::{BTreeSet, HashMap};

use crate::protocol::TypingPayload;
use crate::types::{Conversation, ConversationId, Message, UserId};

/// Client-side projection of the server store, published through a `watch` channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatState {
    /// Most recently active first.
    pub conversations: Vec<Conversation>,
    pub messages: HashMap<ConversationId, Vec<Message>>,
    pub active_id: Option<ConversationId>,
    /// Rooms this client has joined; re-joined after every reconnect.
    pub joined: BTreeSet<ConversationId>,
    pub typing: HashMap<ConversationId, BTreeSet<UserId>>,
    pub connected: bool,
}

impl ChatState {
    pub fn active_messages(&self) -> &[Message] {
        self.active_id
            .as_ref()
            .and_then(|id| self.messages.get(id))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn replace_conversations(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations;
    }

    /// Appends a pushed message. Returns `false` for a message already present.
    pub fn merge_message(&mut self, message: Message) -> bool {
        let list = self
            .messages
            .entry(message.conversation_id.clone())
            .or_default();
        if list.iter().any(|m| m.id == message.id) {
            return false;
        }

        if let Some(typing) = self.typing.get_mut(&message.conversation_id) {
            typing.remove(&message.sender_id);
        }
        if let Some(convo) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == message.conversation_id)
        {
            convo.updated_at = convo.updated_at.max(message.created_at);
        }
        list.push(message);
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        true
    }

    /// Installs fetched history, keeping pushed messages the page does not contain.
    pub fn seed_history(&mut self, conversation_id: &str, fetched: Vec<Message>) {
        let mut history = fetched;
        if let Some(local) = self.messages.remove(conversation_id) {
            for message in local {
                if !history.iter().any(|m| m.id == message.id) {
                    history.push(message);
                }
            }
        }
        history.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.messages.insert(conversation_id.to_string(), history);
    }

    pub fn apply_typing(&mut self, payload: TypingPayload) {
        let users = self.typing.entry(payload.conversation_id).or_default();
        if payload.is_typing {
            users.insert(payload.user_id);
        } else {
            users.remove(&payload.user_id);
        }
    }

    pub fn typing_in(&self, conversation_id: &str) -> impl Iterator<Item = &UserId> {
        self.typing.get(conversation_id).into_iter().flatten()
    }
}
