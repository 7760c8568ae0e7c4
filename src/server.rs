use actix_web::{HttpResponse, web};
use serde_json::json;

use crate::ai;
use crate::chat_server::ChatServerHandle;
use crate::error::ChatError;
use crate::handler::ws_connect;
use crate::profiles;
use crate::types::{
    CreateConversationRequest, Items, ListConversationsQuery, MessagesQuery, SendMessageRequest,
    SharedRoomRequest,
};
use crate::utils::non_empty;

async fn list_conversations(
    query: web::Query<ListConversationsQuery>,
    chat_handle: web::Data<ChatServerHandle>,
) -> Result<HttpResponse, ChatError> {
    let user_id = non_empty(query.into_inner().user_id)
        .ok_or_else(|| ChatError::invalid("userId is required"))?;
    let items = chat_handle.list_conversations(user_id).await?;
    Ok(HttpResponse::Ok().json(Items { items }))
}

async fn create_conversation(
    body: web::Json<CreateConversationRequest>,
    chat_handle: web::Data<ChatServerHandle>,
) -> Result<HttpResponse, ChatError> {
    body.validate()?;
    let CreateConversationRequest {
        participant_ids,
        name,
    } = body.into_inner();
    let convo = chat_handle
        .create_conversation(participant_ids, name)
        .await?;
    Ok(HttpResponse::Created().json(convo))
}

async fn list_messages(
    query: web::Query<MessagesQuery>,
    chat_handle: web::Data<ChatServerHandle>,
) -> Result<HttpResponse, ChatError> {
    let query = query.into_inner();
    let limit = query.effective_limit();
    let conversation_id = non_empty(query.conversation_id)
        .ok_or_else(|| ChatError::invalid("conversationId required"))?;
    let items = chat_handle.get_messages(conversation_id, limit).await?;
    Ok(HttpResponse::Ok().json(Items { items }))
}

async fn send_message(
    body: web::Json<SendMessageRequest>,
    chat_handle: web::Data<ChatServerHandle>,
) -> Result<HttpResponse, ChatError> {
    body.validate()?;
    let message = chat_handle.send_message(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(message))
}

async fn join_shared_room(
    chat_handle: &ChatServerHandle,
    request: SharedRoomRequest,
) -> Result<HttpResponse, ChatError> {
    let convo = chat_handle
        .upsert_shared_conversation(request.key(), request.name(), request.user_id())
        .await?;
    Ok(HttpResponse::Ok().json(convo))
}

/// POST/PUT accept an empty body, which means "default room, anonymous caller".
async fn shared_room_from_body(
    body: web::Bytes,
    chat_handle: web::Data<ChatServerHandle>,
) -> Result<HttpResponse, ChatError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        SharedRoomRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ChatError::invalid(e.to_string()))?
    };
    join_shared_room(&chat_handle, request).await
}

async fn shared_room_from_query(
    query: web::Query<SharedRoomRequest>,
    chat_handle: web::Data<ChatServerHandle>,
) -> Result<HttpResponse, ChatError> {
    join_shared_room(&chat_handle, query.into_inner()).await
}

async fn health(chat_handle: web::Data<ChatServerHandle>) -> Result<HttpResponse, ChatError> {
    let store = chat_handle.store_kind().await?;
    let connections = chat_handle.connection_count().await?;
    Ok(HttpResponse::Ok().json(json!({ "ok": true, "store": store, "connections": connections })))
}

pub fn rest_scope(cfg: &mut web::ServiceConfig) {
    cfg.route("/conversations", web::get().to(list_conversations))
        .route("/conversations", web::post().to(create_conversation))
        .route("/messages", web::get().to(list_messages))
        .route("/messages", web::post().to(send_message))
        .route("/rooms/shared", web::post().to(shared_room_from_body))
        .route("/rooms/shared", web::put().to(shared_room_from_body))
        .route("/rooms/shared", web::get().to(shared_room_from_query));
}

pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| ChatError::invalid(err.to_string()).into())
}

pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _req| ChatError::invalid(err.to_string()).into())
}

/// Mounts every route. Expects `ChatServerHandle`, `AiService` and
/// `ProfileService` app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(query_config())
        .route("/health", web::get().to(health))
        .service(
            web::scope("/api")
                .route("/ws", web::get().to(ws_connect))
                .service(web::scope("/chat").configure(rest_scope))
                .service(web::scope("/ai").configure(ai::ai_scope))
                .service(web::scope("/profile").configure(profiles::profile_scope))
                .service(web::scope("/matches").configure(profiles::matches_scope)),
        );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiService;
    use crate::chat_server::ChatServer;
    use crate::error::ErrorBody;
    use crate::profiles::{Profile, ProfileService};
    use crate::store::InMemoryRepository;
    use crate::types::{Conversation, Message, SHARED_ROOM_KEY};
    use actix_web::{App, http::StatusCode, test};
    use serde_json::Value;

    macro_rules! app {
        () => {{
            let (server, handle) = ChatServer::new(InMemoryRepository::new());
            tokio::spawn(server.run());
            test::init_service(
                App::new()
                    .app_data(web::Data::new(handle))
                    .app_data(web::Data::new(AiService::new(None, None)))
                    .app_data(web::Data::new(ProfileService::in_memory()))
                    .configure(configure),
            )
            .await
        }};
    }

    #[actix_web::test]
    async fn list_conversations_requires_user() {
        let app = app!();
        let req = test::TestRequest::get()
            .uri("/api/chat/conversations")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = test::read_body_json(resp).await;
        assert_eq!(body.error, "userId is required");
    }

    #[actix_web::test]
    async fn create_then_list_conversation() {
        let app = app!();
        let req = test::TestRequest::post()
            .uri("/api/chat/conversations")
            .set_json(json!({ "participantIds": ["u1", "u2"] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let convo: Conversation = test::read_body_json(resp).await;
        assert!(!convo.is_group);
        assert_eq!(convo.name, None);

        let req = test::TestRequest::get()
            .uri("/api/chat/conversations?userId=u2")
            .to_request();
        let listed: Items<Conversation> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(listed.items.len(), 1);
        assert_eq!(listed.items[0].id, convo.id);
    }

    #[actix_web::test]
    async fn create_rejects_single_participant() {
        let app = app!();
        for body in [
            json!({ "participantIds": ["u1"] }),
            json!({ "participantIds": ["u1", "u1"] }),
            json!({ "participantIds": "u1,u2" }),
        ] {
            let req = test::TestRequest::post()
                .uri("/api/chat/conversations")
                .set_json(body)
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[actix_web::test]
    async fn send_and_fetch_messages() {
        let app = app!();
        let req = test::TestRequest::post()
            .uri("/api/chat/conversations")
            .set_json(json!({ "participantIds": ["u1", "u2"], "name": "pair" }))
            .to_request();
        let convo: Conversation = test::call_and_read_body_json(&app, req).await;

        for text in ["one", "two", "three"] {
            let req = test::TestRequest::post()
                .uri("/api/chat/messages")
                .set_json(json!({ "conversationId": convo.id, "senderId": "u1", "text": text }))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::CREATED);
        }

        let req = test::TestRequest::get()
            .uri(&format!("/api/chat/messages?conversationId={}&limit=2", convo.id))
            .to_request();
        let page: Items<Message> = test::call_and_read_body_json(&app, req).await;
        let texts: Vec<&str> = page.items.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["two", "three"]);

        let req = test::TestRequest::get()
            .uri(&format!("/api/chat/messages?conversationId={}&limit=0", convo.id))
            .to_request();
        let all: Items<Message> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(all.items.len(), 3);
    }

    #[actix_web::test]
    async fn message_endpoint_errors() {
        let app = app!();

        let req = test::TestRequest::post()
            .uri("/api/chat/messages")
            .set_json(json!({ "conversationId": "missing-id", "senderId": "u1", "text": "hi" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/api/chat/messages")
            .set_json(json!({ "conversationId": "c1", "text": "hi" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/chat/messages").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/api/chat/messages?conversationId=c1&limit=lots")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].is_string());

        let req = test::TestRequest::get()
            .uri("/api/chat/messages?conversationId=unknown")
            .to_request();
        let empty: Items<Message> = test::call_and_read_body_json(&app, req).await;
        assert!(empty.items.is_empty());
    }

    #[actix_web::test]
    async fn shared_room_variants_agree() {
        let app = app!();

        let req = test::TestRequest::post()
            .uri("/api/chat/rooms/shared")
            .set_json(json!({ "userId": "u1" }))
            .to_request();
        let via_post: Conversation = test::call_and_read_body_json(&app, req).await;
        assert_eq!(via_post.name.as_deref(), Some("Shared Demo"));

        let req = test::TestRequest::get()
            .uri(&format!("/api/chat/rooms/shared?key={}&userId=u2", SHARED_ROOM_KEY))
            .to_request();
        let via_get: Conversation = test::call_and_read_body_json(&app, req).await;

        let req = test::TestRequest::post().uri("/api/chat/rooms/shared").to_request();
        let anonymous: Conversation = test::call_and_read_body_json(&app, req).await;

        assert_eq!(via_post.id, via_get.id);
        assert_eq!(via_get.id, anonymous.id);
        assert_eq!(anonymous.participant_ids, vec!["u1", "u2"]);
    }

    #[actix_web::test]
    async fn health_reports_store_kind() {
        let app = app!();
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({ "ok": true, "store": "memory", "connections": 0 }));
    }

    #[actix_web::test]
    async fn profile_and_match_routes_are_mounted() {
        let app = app!();
        let req = test::TestRequest::post()
            .uri("/api/profile")
            .set_json(json!({ "username": "ada", "areas": ["Gaming"] }))
            .to_request();
        let ada: Profile = test::call_and_read_body_json(&app, req).await;
        let req = test::TestRequest::post()
            .uri("/api/profile")
            .set_json(json!({ "username": "grace", "areas": ["gaming"] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let req = test::TestRequest::get()
            .uri(&format!("/api/matches/{}?limit=5", ada.id))
            .to_request();
        let ranked: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(ranked[0]["username"], "grace");

        let req = test::TestRequest::get().uri("/api/profile/missing").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = test::read_body_json(resp).await;
        assert_eq!(body.error, "Profile not found: missing");
    }

    #[actix_web::test]
    async fn ai_analyze_validates_user() {
        let app = app!();
        let req = test::TestRequest::post()
            .uri("/api/ai/analyze")
            .set_json(json!({ "user": { "id": "1" } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/api/ai/analyze")
            .set_json(json!({ "user": { "id": "1", "username": "ada", "areas": ["Gaming"] } }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("X-AI-Used-Fallback").unwrap(), "true");
    }
}
