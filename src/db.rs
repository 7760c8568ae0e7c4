use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{DateTime as BsonDateTime, Document, doc, oid::ObjectId};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;
use crate::profiles::{Profile, ProfileRepository};
use crate::store::ConversationRepository;
use crate::types::{Conversation, ConversationId, Message, UserId};
use crate::utils::{dedupe_ids, non_empty, now_not_before};

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct ConversationDocument {
    #[serde(rename = "_id")]
    id: ConversationId,
    name: Option<String>,
    is_group: bool,
    participant_ids: Vec<UserId>,
    created_at: BsonDateTime,
    updated_at: BsonDateTime,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct MessageDocument {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    oid: Option<ObjectId>,
    id: String,
    conversation_id: ConversationId,
    sender_id: UserId,
    text: String,
    created_at: BsonDateTime,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
struct SharedRoomDocument {
    #[serde(rename = "_id")]
    key: String,
    conversation_id: ConversationId,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct ProfileDocument {
    #[serde(rename = "_id")]
    id: String,
    username: String,
    first_name: String,
    last_name: String,
    email: String,
    areas: Vec<String>,
    vibe_tags: Vec<String>,
    goals: String,
    experience_level: String,
    bio: String,
    location: String,
    created_at: Option<BsonDateTime>,
    updated_at: Option<BsonDateTime>,
}

fn to_bson(at: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(at.timestamp_millis())
}

fn from_bson(at: BsonDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or_default()
}

impl From<ConversationDocument> for Conversation {
    fn from(doc: ConversationDocument) -> Self {
        Conversation {
            id: doc.id,
            name: doc.name,
            is_group: doc.is_group,
            participant_ids: doc.participant_ids,
            created_at: from_bson(doc.created_at),
            updated_at: from_bson(doc.updated_at),
        }
    }
}

impl From<MessageDocument> for Message {
    fn from(doc: MessageDocument) -> Self {
        Message {
            id: doc.id,
            conversation_id: doc.conversation_id,
            sender_id: doc.sender_id,
            text: doc.text,
            created_at: from_bson(doc.created_at),
        }
    }
}

impl From<Profile> for ProfileDocument {
    fn from(p: Profile) -> Self {
        ProfileDocument {
            id: p.id,
            username: p.username,
            first_name: p.first_name,
            last_name: p.last_name,
            email: p.email,
            areas: p.areas,
            vibe_tags: p.vibe_tags,
            goals: p.goals,
            experience_level: p.experience_level,
            bio: p.bio,
            location: p.location,
            created_at: p.created_at.map(to_bson),
            updated_at: p.updated_at.map(to_bson),
        }
    }
}

impl From<ProfileDocument> for Profile {
    fn from(doc: ProfileDocument) -> Self {
        Profile {
            id: doc.id,
            username: doc.username,
            first_name: doc.first_name,
            last_name: doc.last_name,
            email: doc.email,
            areas: doc.areas,
            vibe_tags: doc.vibe_tags,
            goals: doc.goals,
            experience_level: doc.experience_level,
            bio: doc.bio,
            location: doc.location,
            created_at: doc.created_at.map(from_bson),
            updated_at: doc.updated_at.map(from_bson),
        }
    }
}

fn get_conversation_collection(db: &Database) -> Collection<ConversationDocument> {
    db.collection("conversations")
}

fn get_message_collection(db: &Database) -> Collection<MessageDocument> {
    db.collection("messages")
}

fn get_shared_room_collection(db: &Database) -> Collection<SharedRoomDocument> {
    db.collection("shared_rooms")
}

fn get_profile_collection(db: &Database) -> Collection<ProfileDocument> {
    db.collection("users")
}

/// Replica set members and mongos routers answer `hello` with `setName` or
/// `msg: "isdbgrid"`. Standalone servers reject multi-document transactions.
fn reply_supports_transactions(reply: &Document) -> bool {
    reply.get_str("setName").is_ok() || matches!(reply.get_str("msg"), Ok("isdbgrid"))
}

async fn supports_transactions(db: &Database) -> bool {
    match db.run_command(doc! { "hello": 1 }).await {
        Ok(reply) => reply_supports_transactions(&reply),
        Err(e) => {
            log::warn!("MongoDB hello failed, assuming no transactions: {}", e);
            false
        }
    }
}

/// Repository backed by a MongoDB database.
///
/// Timestamps are stored with millisecond precision. Message order within a
/// conversation follows `createdAt` and then the driver-assigned `_id`, which
/// increases monotonically for a single writer.
///
/// Appending a message writes the message and bumps the conversation's
/// `updatedAt`. On a replica set or sharded cluster both writes share one
/// transaction. A standalone server has no transactions, so a failed bump
/// deletes the message it just inserted instead.
pub struct MongoRepository {
    client: Client,
    conversations: Collection<ConversationDocument>,
    messages: Collection<MessageDocument>,
    shared_rooms: Collection<SharedRoomDocument>,
    transactions: bool,
}

impl MongoRepository {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, ChatError> {
        let client = Client::with_uri_str(uri).await?;
        Self::open(client, database).await
    }

    /// Uses an already connected client, so other repositories can share it.
    pub async fn open(client: Client, database: &str) -> Result<Self, ChatError> {
        let db = client.database(database);
        let transactions = supports_transactions(&db).await;
        let repo = Self {
            conversations: get_conversation_collection(&db),
            messages: get_message_collection(&db),
            shared_rooms: get_shared_room_collection(&db),
            client,
            transactions,
        };
        repo.ensure_indexes().await?;
        log::info!(
            "MongoDB connected, database {} (transactions: {})",
            database,
            transactions
        );
        Ok(repo)
    }

    async fn ensure_indexes(&self) -> Result<(), ChatError> {
        self.conversations
            .create_index(IndexModel::builder().keys(doc! { "participantIds": 1 }).build())
            .await?;
        self.messages
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "conversationId": 1, "createdAt": -1 })
                    .build(),
            )
            .await?;
        Ok(())
    }

    async fn find_conversation(&self, conversation_id: &str) -> Result<ConversationDocument, ChatError> {
        self.conversations
            .find_one(doc! { "_id": conversation_id })
            .await?
            .ok_or_else(|| ChatError::not_found(conversation_id))
    }

    async fn insert_conversation(
        &self,
        participant_ids: Vec<UserId>,
        name: Option<String>,
    ) -> Result<ConversationDocument, ChatError> {
        let is_group = participant_ids.len() > 2;
        let participant_ids = dedupe_ids(participant_ids);
        let now = to_bson(Utc::now());
        let doc = ConversationDocument {
            id: Uuid::new_v4().to_string(),
            name: non_empty(name),
            is_group,
            participant_ids,
            created_at: now,
            updated_at: now,
        };
        self.conversations.insert_one(&doc).await?;
        Ok(doc)
    }

    async fn join(&self, conversation_id: &str, user_id: Option<&str>) -> Result<Conversation, ChatError> {
        let mut convo = self.find_conversation(conversation_id).await?;
        let Some(user_id) = user_id.filter(|id| !id.trim().is_empty()) else {
            return Ok(convo.into());
        };
        if convo.participant_ids.iter().any(|id| id == user_id) {
            return Ok(convo.into());
        }

        let updated_at = to_bson(now_not_before(from_bson(convo.updated_at)));
        self.conversations
            .update_one(
                doc! { "_id": conversation_id },
                doc! {
                    "$addToSet": { "participantIds": user_id },
                    "$max": { "updatedAt": updated_at },
                },
            )
            .await?;
        convo.participant_ids.push(user_id.to_string());
        convo.updated_at = updated_at;
        Ok(convo.into())
    }
}

impl MongoRepository {
    async fn append_in_transaction(&self, message: &MessageDocument) -> Result<(), ChatError> {
        let mut session = self.client.start_session().await?;
        session.start_transaction().await?;
        // Dropping an uncommitted session aborts the transaction.
        self.messages.insert_one(message).session(&mut session).await?;
        self.conversations
            .update_one(
                doc! { "_id": message.conversation_id.as_str() },
                doc! { "$max": { "updatedAt": message.created_at } },
            )
            .session(&mut session)
            .await?;
        session.commit_transaction().await?;
        Ok(())
    }

    async fn append_with_undo(&self, message: &MessageDocument) -> Result<(), ChatError> {
        self.messages.insert_one(message).await?;
        let touched = self
            .conversations
            .update_one(
                doc! { "_id": message.conversation_id.as_str() },
                doc! { "$max": { "updatedAt": message.created_at } },
            )
            .await;
        if let Err(err) = touched {
            if let Err(undo) = self.messages.delete_one(doc! { "id": message.id.as_str() }).await {
                log::error!("Failed to remove orphaned message {}: {}", message.id, undo);
            }
            return Err(err.into());
        }
        Ok(())
    }
}

impl ConversationRepository for MongoRepository {
    fn kind(&self) -> &'static str {
        "mongodb"
    }

    async fn create_conversation(
        &mut self,
        participant_ids: Vec<UserId>,
        name: Option<String>,
    ) -> Result<Conversation, ChatError> {
        Ok(self.insert_conversation(participant_ids, name).await?.into())
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, ChatError> {
        if user_id.is_empty() {
            return Ok(Vec::new());
        }
        let docs: Vec<ConversationDocument> = self
            .conversations
            .find(doc! { "participantIds": user_id })
            .sort(doc! { "updatedAt": -1 })
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Conversation::from).collect())
    }

    async fn get_messages(
        &self,
        conversation_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ChatError> {
        let filter = doc! { "conversationId": conversation_id };
        let docs: Vec<MessageDocument> = match limit {
            Some(limit) => {
                let mut newest_first: Vec<MessageDocument> = self
                    .messages
                    .find(filter)
                    .sort(doc! { "createdAt": -1, "_id": -1 })
                    .limit(limit as i64)
                    .await?
                    .try_collect()
                    .await?;
                newest_first.reverse();
                newest_first
            }
            None => {
                self.messages
                    .find(filter)
                    .sort(doc! { "createdAt": 1, "_id": 1 })
                    .await?
                    .try_collect()
                    .await?
            }
        };
        Ok(docs.into_iter().map(Message::from).collect())
    }

    async fn add_message(
        &mut self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<Message, ChatError> {
        let convo = self.find_conversation(conversation_id).await?;
        let created_at = to_bson(now_not_before(from_bson(convo.updated_at)));
        let doc = MessageDocument {
            oid: None,
            id: Uuid::new_v4().to_string(),
            conversation_id: convo.id.clone(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            created_at,
        };
        if self.transactions {
            self.append_in_transaction(&doc).await?;
        } else {
            self.append_with_undo(&doc).await?;
        }
        Ok(doc.into())
    }

    async fn add_participant(
        &mut self,
        conversation_id: &str,
        user_id: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        self.join(conversation_id, user_id).await
    }

    async fn upsert_shared_conversation(
        &mut self,
        key: &str,
        name: &str,
        user_id: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        let known = match self.shared_rooms.find_one(doc! { "_id": key }).await? {
            Some(room) => self
                .conversations
                .find_one(doc! { "_id": room.conversation_id.as_str() })
                .await?
                .map(|c| c.id),
            None => None,
        };

        let conversation_id = match known {
            Some(id) => id,
            None => {
                let participants = user_id
                    .filter(|id| !id.trim().is_empty())
                    .map(|id| vec![id.to_string()])
                    .unwrap_or_default();
                let convo = self
                    .insert_conversation(participants, Some(name.to_string()))
                    .await?;
                self.shared_rooms
                    .update_one(
                        doc! { "_id": key },
                        doc! { "$set": { "conversationId": convo.id.as_str() } },
                    )
                    .upsert(true)
                    .await?;
                convo.id
            }
        };

        self.join(&conversation_id, user_id).await
    }
}

/// Profiles stored in the `users` collection, unique by username.
pub struct MongoProfileRepository {
    profiles: Collection<ProfileDocument>,
}

impl MongoProfileRepository {
    pub async fn open(db: &Database) -> Result<Self, ChatError> {
        let profiles = get_profile_collection(db);
        profiles
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "username": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;
        profiles
            .create_index(IndexModel::builder().keys(doc! { "createdAt": -1 }).build())
            .await?;
        Ok(Self { profiles })
    }
}

impl ProfileRepository for MongoProfileRepository {
    async fn get(&self, id: &str) -> Result<Option<Profile>, ChatError> {
        Ok(self.profiles.find_one(doc! { "_id": id }).await?.map(Profile::from))
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<Profile>, ChatError> {
        Ok(self
            .profiles
            .find_one(doc! { "username": username })
            .await?
            .map(Profile::from))
    }

    async fn put(&self, profile: Profile) -> Result<(), ChatError> {
        let doc = ProfileDocument::from(profile);
        self.profiles
            .replace_one(doc! { "_id": doc.id.as_str() }, &doc)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<Profile>, ChatError> {
        let docs: Vec<ProfileDocument> = self
            .profiles
            .find(doc! {})
            .sort(doc! { "createdAt": -1 })
            .limit(limit as i64)
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Profile::from).collect())
    }
}
