//! Conversation and message storage.
//!
//! [`ConversationRepository`] is the only authority on which conversations
//! exist and in which order their messages were appended. The gateway actor owns
//! exactly one repository, so implementations never see concurrent calls.

use std::collections::HashMap;
use std::future::Future;

use chrono::Utc;
use uuid::Uuid;

use crate::error::ChatError;
use crate::types::{Conversation, ConversationId, Message, UserId};
use crate::utils::{dedupe_ids, non_empty, now_not_before};

pub trait ConversationRepository: Send + Sync + 'static {
    /// Short label reported by the health endpoint.
    fn kind(&self) -> &'static str;

    /// Creates a conversation. The group flag is fixed from the requested
    /// participant count; duplicates are then dropped from the stored list.
    fn create_conversation(
        &mut self,
        participant_ids: Vec<UserId>,
        name: Option<String>,
    ) -> impl Future<Output = Result<Conversation, ChatError>> + Send;

    /// Conversations containing `user_id`, most recently active first.
    fn list_conversations(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<Conversation>, ChatError>> + Send;

    /// The newest `limit` messages in append order; `None` returns everything.
    /// Unknown conversations yield an empty list.
    fn get_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Message>, ChatError>> + Send;

    fn add_message(
        &mut self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<Message, ChatError>> + Send;

    fn add_participant(
        &mut self,
        conversation_id: &str,
        user_id: Option<&str>,
    ) -> impl Future<Output = Result<Conversation, ChatError>> + Send;

    fn upsert_shared_conversation(
        &mut self,
        key: &str,
        name: &str,
        user_id: Option<&str>,
    ) -> impl Future<Output = Result<Conversation, ChatError>> + Send;
}

/// Process-local repository. State is lost on restart.
#[derive(Default)]
pub struct InMemoryRepository {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    shared_by_key: HashMap<String, ConversationId>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_conversation(
        &mut self,
        participant_ids: Vec<UserId>,
        name: Option<String>,
    ) -> Conversation {
        let is_group = participant_ids.len() > 2;
        let participant_ids = dedupe_ids(participant_ids);
        let now = Utc::now();
        let convo = Conversation {
            id: Uuid::new_v4().to_string(),
            name: non_empty(name),
            is_group,
            participant_ids,
            created_at: now,
            updated_at: now,
        };
        self.conversations.insert(convo.id.clone(), convo.clone());
        self.messages.insert(convo.id.clone(), Vec::new());
        convo
    }

    fn join(&mut self, conversation_id: &str, user_id: Option<&str>) -> Result<Conversation, ChatError> {
        let convo = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::not_found(conversation_id))?;

        if let Some(user_id) = user_id.filter(|id| !id.trim().is_empty()) {
            if !convo.has_participant(user_id) {
                convo.participant_ids.push(user_id.to_string());
                convo.updated_at = now_not_before(convo.updated_at);
            }
        }
        Ok(convo.clone())
    }
}

impl ConversationRepository for InMemoryRepository {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn create_conversation(
        &mut self,
        participant_ids: Vec<UserId>,
        name: Option<String>,
    ) -> Result<Conversation, ChatError> {
        Ok(self.insert_conversation(participant_ids, name))
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, ChatError> {
        if user_id.is_empty() {
            return Ok(Vec::new());
        }
        let mut items: Vec<Conversation> = self
            .conversations
            .values()
            .filter(|c| c.has_participant(user_id))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(items)
    }

    async fn get_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ChatError> {
        let Some(history) = self.messages.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let start = match limit {
            Some(limit) => history.len().saturating_sub(limit),
            None => 0,
        };
        Ok(history[start..].to_vec())
    }

    async fn add_message(
        &mut self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<Message, ChatError> {
        let convo = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::not_found(conversation_id))?;

        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: convo.id.clone(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            created_at: now_not_before(convo.updated_at),
        };
        convo.updated_at = message.created_at;
        self.messages
            .entry(convo.id.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn add_participant(
        &mut self,
        conversation_id: &str,
        user_id: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        self.join(conversation_id, user_id)
    }

    async fn upsert_shared_conversation(
        &mut self,
        key: &str,
        name: &str,
        user_id: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        let known = self
            .shared_by_key
            .get(key)
            .filter(|id| self.conversations.contains_key(*id))
            .cloned();

        let conversation_id = match known {
            Some(id) => id,
            None => {
                let participants = user_id
                    .filter(|id| !id.trim().is_empty())
                    .map(|id| vec![id.to_string()])
                    .unwrap_or_default();
                let convo = self.insert_conversation(participants, Some(name.to_string()));
                self.shared_by_key.insert(key.to_string(), convo.id.clone());
                convo.id
            }
        };

        self.join(&conversation_id, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn direct_conversation_defaults() {
        let mut repo = InMemoryRepository::new();
        let convo = repo
            .create_conversation(ids(&["u1", "u2"]), None)
            .await
            .unwrap();

        assert!(!convo.is_group);
        assert_eq!(convo.name, None);
        assert_eq!(convo.participant_ids, ids(&["u1", "u2"]));
        assert_eq!(convo.created_at, convo.updated_at);
    }

    #[tokio::test]
    async fn group_flag_counts_requested_participants() {
        let mut repo = InMemoryRepository::new();
        let trio = repo
            .create_conversation(ids(&["u1", "u2", "u3"]), Some("crew".into()))
            .await
            .unwrap();
        assert!(trio.is_group);
        assert_eq!(trio.name.as_deref(), Some("crew"));

        let dupes = repo
            .create_conversation(ids(&["u1", "u2", "u2"]), None)
            .await
            .unwrap();
        assert!(dupes.is_group);
        assert_eq!(dupes.participant_ids, ids(&["u1", "u2"]));

        let pair = repo
            .create_conversation(ids(&["u1", "u1"]), None)
            .await
            .unwrap();
        assert!(!pair.is_group);
        assert_eq!(pair.participant_ids, ids(&["u1"]));
    }

    #[tokio::test]
    async fn empty_participant_list_is_accepted() {
        let mut repo = InMemoryRepository::new();
        let convo = repo.create_conversation(Vec::new(), None).await.unwrap();
        assert!(convo.participant_ids.is_empty());
    }

    #[tokio::test]
    async fn shared_room_resolves_to_one_conversation() {
        let mut repo = InMemoryRepository::new();
        let first = repo
            .upsert_shared_conversation("demo", "Demo", Some("u1"))
            .await
            .unwrap();
        let second = repo
            .upsert_shared_conversation("demo", "Ignored", Some("u2"))
            .await
            .unwrap();
        let again = repo
            .upsert_shared_conversation("demo", "Demo", Some("u1"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.id, again.id);
        assert_eq!(again.participant_ids, ids(&["u1", "u2"]));
        assert_eq!(again.name.as_deref(), Some("Demo"));
    }

    #[tokio::test]
    async fn shared_room_collects_every_caller() {
        let mut repo = InMemoryRepository::new();
        let users: Vec<String> = (0..10).map(|i| format!("user-{i}")).collect();
        let mut seen = Vec::new();
        for user in &users {
            seen.push(
                repo.upsert_shared_conversation("lobby", "Lobby", Some(user))
                    .await
                    .unwrap(),
            );
        }
        let last = seen.last().unwrap();
        assert!(seen.iter().all(|c| c.id == last.id));
        assert_eq!(last.participant_ids, users);
    }

    #[tokio::test]
    async fn shared_room_without_user_has_no_participants() {
        let mut repo = InMemoryRepository::new();
        let convo = repo
            .upsert_shared_conversation("quiet", "Quiet", None)
            .await
            .unwrap();
        assert!(convo.participant_ids.is_empty());
    }

    #[tokio::test]
    async fn append_to_missing_conversation_fails() {
        let mut repo = InMemoryRepository::new();
        let err = repo.add_message("missing-id", "u1", "hi").await.unwrap_err();
        assert_eq!(err, ChatError::not_found("missing-id"));
        assert!(repo.get_messages("missing-id", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_are_chronological_suffix() {
        let mut repo = InMemoryRepository::new();
        let convo = repo
            .create_conversation(ids(&["u1", "u2"]), None)
            .await
            .unwrap();
        for i in 0..8 {
            repo.add_message(&convo.id, "u1", &format!("m{i}"))
                .await
                .unwrap();
        }

        let all = repo.get_messages(&convo.id, None).await.unwrap();
        assert_eq!(all.len(), 8);
        assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let tail = repo.get_messages(&convo.id, Some(3)).await.unwrap();
        let texts: Vec<&str> = tail.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m5", "m6", "m7"]);
        assert_eq!(tail.as_slice(), &all[5..]);
    }

    #[tokio::test]
    async fn append_bumps_updated_at_and_listing_order() {
        let mut repo = InMemoryRepository::new();
        let older = repo
            .create_conversation(ids(&["u1", "u2"]), None)
            .await
            .unwrap();
        let newer = repo
            .create_conversation(ids(&["u1", "u3"]), None)
            .await
            .unwrap();

        let msg = repo.add_message(&older.id, "u2", "ping").await.unwrap();
        let listed = repo.list_conversations("u1").await.unwrap();

        assert_eq!(listed[0].id, older.id);
        assert_eq!(listed[0].updated_at, msg.created_at);
        assert!(listed[0].updated_at >= older.created_at);
        assert_eq!(listed[1].id, newer.id);
    }

    #[tokio::test]
    async fn existing_participant_is_a_no_op() {
        let mut repo = InMemoryRepository::new();
        let convo = repo
            .create_conversation(ids(&["u1", "u2"]), None)
            .await
            .unwrap();

        let same = repo.add_participant(&convo.id, Some("u1")).await.unwrap();
        assert_eq!(same, convo);
        let blank = repo.add_participant(&convo.id, Some("")).await.unwrap();
        assert_eq!(blank, convo);

        let grown = repo.add_participant(&convo.id, Some("u3")).await.unwrap();
        assert_eq!(grown.participant_ids, ids(&["u1", "u2", "u3"]));
        assert!(grown.updated_at >= convo.updated_at);
        assert!(!grown.is_group);
    }

    #[tokio::test]
    async fn add_participant_to_missing_conversation_fails() {
        let mut repo = InMemoryRepository::new();
        let err = repo.add_participant("nope", Some("u1")).await.unwrap_err();
        assert!(matches!(err, ChatError::ConversationNotFound(_)));
    }

    #[tokio::test]
    async fn listing_only_returns_own_conversations() {
        let mut repo = InMemoryRepository::new();
        repo.create_conversation(ids(&["u1", "u2"]), None)
            .await
            .unwrap();
        repo.create_conversation(ids(&["u3", "u4"]), None)
            .await
            .unwrap();
        repo.upsert_shared_conversation("demo", "Demo", Some("u1"))
            .await
            .unwrap();

        let listed = repo.list_conversations("u1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|c| c.has_participant("u1")));
        assert!(repo.list_conversations("").await.unwrap().is_empty());
    }
}
