use actix_web::{Error, HttpRequest, HttpResponse, web};
use actix_ws::{CloseCode, CloseReason, Message as WsMessage, MessageStream, Session};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio::{sync::mpsc, time::interval};

use crate::chat_server::{ChatServerHandle, ConnId};
use crate::error::ChatError;
use crate::protocol::{
    AckPayload, ClientFrame, EVENT_JOIN, EVENT_PING, EVENT_SEND, EVENT_TYPING, JoinPayload,
    ServerEvent, TypingPayload,
};
use crate::types::SendMessageRequest;
use crate::utils::non_empty;

// WebSocket connection constants
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upgrades `GET /api/ws` into a realtime channel.
pub async fn ws_connect(
    req: HttpRequest,
    body: web::Payload,
    chat_handle: web::Data<ChatServerHandle>,
) -> Result<HttpResponse, Error> {
    let (response, session, msg_stream) = actix_ws::handle(&req, body)?;

    actix_web::rt::spawn(websocket_handler(
        session,
        msg_stream,
        chat_handle.get_ref().clone(),
    ));

    Ok(response)
}

async fn websocket_handler(
    mut session: Session,
    mut msg_stream: MessageStream,
    chat_handle: ChatServerHandle,
) {
    // Room broadcasts and our own replies share one queue so a sender always
    // sees its `message:new` before the matching ack.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let conn_id = match chat_handle.connect(event_tx.clone()) {
        Ok(conn_id) => conn_id,
        Err(e) => {
            log::error!("Failed to register channel: {}", e);
            let _ = session
                .close(Some(CloseReason {
                    code: CloseCode::Error,
                    description: Some(e.to_string()),
                }))
                .await;
            return;
        }
    };
    log::info!("Channel {} connected", conn_id);

    let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);
    let mut last_heartbeat = Instant::now();

    let close_reason = loop {
        tokio::select! {
            incoming = msg_stream.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        log::warn!("Channel {} protocol error: {:?}", conn_id, e);
                        break None;
                    }
                    None => break None,
                };
                match msg {
                    WsMessage::Text(text) => {
                        last_heartbeat = Instant::now();
                        let reply = match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => handle_frame(&chat_handle, conn_id, frame).await,
                            Err(e) => Some(ServerEvent::Error {
                                message: format!("Malformed frame: {}", e),
                            }),
                        };
                        if let Some(reply) = reply {
                            let _ = event_tx.send(reply);
                        }
                    }
                    WsMessage::Ping(bytes) => {
                        last_heartbeat = Instant::now();
                        if session.pong(&bytes).await.is_err() {
                            break None;
                        }
                    }
                    WsMessage::Pong(_) => {
                        last_heartbeat = Instant::now();
                    }
                    WsMessage::Close(reason) => break reason,
                    WsMessage::Binary(_) | WsMessage::Continuation(_) | WsMessage::Nop => {}
                }
            }

            Some(event) = event_rx.recv() => {
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if session.text(json).await.is_err() {
                            break None;
                        }
                    }
                    Err(e) => log::error!("Failed to encode event for {}: {}", conn_id, e),
                }
            }

            _ = heartbeat_interval.tick() => {
                if Instant::now().duration_since(last_heartbeat) > CLIENT_TIMEOUT {
                    log::info!("Channel {} heartbeat timeout, disconnecting", conn_id);
                    break None;
                }
                if session.ping(b"").await.is_err() {
                    break None;
                }
            }
        }
    };

    let _ = session.close(close_reason).await;
    let _ = chat_handle.disconnect(conn_id);
    log::info!("Channel {} closed", conn_id);
}

fn parse<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, ChatError> {
    serde_json::from_value(data).map_err(|e| ChatError::invalid(format!("Malformed payload: {}", e)))
}

fn reject(ack: Option<u64>, err: ChatError) -> Option<ServerEvent> {
    Some(match ack {
        Some(id) => ServerEvent::Ack(AckPayload::failed(id, err.to_string())),
        None => ServerEvent::Error {
            message: err.to_string(),
        },
    })
}

/// Translates one client frame into gateway calls; returns the direct reply, if any.
async fn handle_frame(
    chat_handle: &ChatServerHandle,
    conn_id: ConnId,
    frame: ClientFrame,
) -> Option<ServerEvent> {
    let ack = frame.ack;
    match frame.event.as_str() {
        EVENT_JOIN => {
            let payload: JoinPayload = match parse(frame.data) {
                Ok(payload) => payload,
                Err(e) => return reject(ack, e),
            };
            if payload.conversation_id.is_empty() {
                return reject(ack, ChatError::invalid("conversationId required"));
            }
            if let Err(e) = chat_handle
                .join(conn_id, payload.conversation_id, non_empty(payload.user_id))
                .await
            {
                return reject(ack, e);
            }
            ack.map(|id| ServerEvent::Ack(AckPayload::ok(id, None)))
        }
        EVENT_SEND => {
            let request: SendMessageRequest = match parse(frame.data) {
                Ok(request) => request,
                Err(e) => return reject(ack, e),
            };
            if let Err(e) = request.validate() {
                return reject(ack, e);
            }
            match chat_handle.send_message(request).await {
                Ok(message) => ack.map(|id| ServerEvent::Ack(AckPayload::ok(id, Some(message)))),
                Err(e) => reject(ack, e),
            }
        }
        EVENT_TYPING => {
            let payload: TypingPayload = match parse(frame.data) {
                Ok(payload) => payload,
                Err(e) => return reject(ack, e),
            };
            match chat_handle.typing(conn_id, payload) {
                Ok(()) => None,
                Err(e) => reject(ack, e),
            }
        }
        EVENT_PING => Some(ServerEvent::Pong),
        other => reject(ack, ChatError::invalid(format!("Unknown event: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_server::ChatServer;
    use crate::store::InMemoryRepository;
    use serde_json::json;

    fn frame(event: &str, data: serde_json::Value, ack: Option<u64>) -> ClientFrame {
        ClientFrame {
            event: event.into(),
            data,
            ack,
        }
    }

    fn connected() -> (ChatServerHandle, ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (server, handle) = ChatServer::new(InMemoryRepository::new());
        tokio::spawn(server.run());
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = handle.connect(tx).unwrap();
        (handle, conn_id, rx)
    }

    #[tokio::test]
    async fn send_acks_with_stored_message() {
        let (handle, conn_id, mut rx) = connected();
        let convo = handle
            .upsert_shared_conversation("demo".into(), "Demo".into(), Some("u1".into()))
            .await
            .unwrap();

        let joined = handle_frame(
            &handle,
            conn_id,
            frame(EVENT_JOIN, json!({"conversationId": convo.id, "userId": "u1"}), Some(1)),
        )
        .await;
        assert_eq!(joined, Some(ServerEvent::Ack(AckPayload::ok(1, None))));

        let reply = handle_frame(
            &handle,
            conn_id,
            frame(
                EVENT_SEND,
                json!({"conversationId": convo.id, "senderId": "u1", "text": "hello"}),
                Some(2),
            ),
        )
        .await;
        let ack = match reply {
            Some(ServerEvent::Ack(ack)) => ack,
            other => panic!("expected ack, got {other:?}"),
        };
        assert!(ack.ok);
        let stored = ack.message.unwrap();
        assert_eq!(stored.text, "hello");

        match rx.recv().await {
            Some(ServerEvent::MessageNew(msg)) => assert_eq!(msg, stored),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_unknown_conversation_is_negative_ack() {
        let (handle, conn_id, mut rx) = connected();
        let reply = handle_frame(
            &handle,
            conn_id,
            frame(
                EVENT_SEND,
                json!({"conversationId": "missing-id", "senderId": "u1", "text": "hi"}),
                Some(9),
            ),
        )
        .await;
        let ack = match reply {
            Some(ServerEvent::Ack(ack)) => ack,
            other => panic!("expected ack, got {other:?}"),
        };
        assert_eq!(ack.id, 9);
        assert!(!ack.ok);
        assert!(ack.error.unwrap().contains("not found"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_of_unknown_conversation_still_succeeds() {
        let (handle, conn_id, _rx) = connected();
        let reply = handle_frame(
            &handle,
            conn_id,
            frame(EVENT_JOIN, json!({"conversationId": "ghost", "userId": "u1"}), Some(3)),
        )
        .await;
        assert_eq!(reply, Some(ServerEvent::Ack(AckPayload::ok(3, None))));
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_reported() {
        let (handle, conn_id, _rx) = connected();

        let missing = handle_frame(&handle, conn_id, frame(EVENT_SEND, json!(null), None)).await;
        assert!(matches!(missing, Some(ServerEvent::Error { .. })));

        let blank = handle_frame(
            &handle,
            conn_id,
            frame(EVENT_SEND, json!({"conversationId": "c", "senderId": "u", "text": " "}), Some(4)),
        )
        .await;
        assert!(matches!(blank, Some(ServerEvent::Ack(AckPayload { ok: false, .. }))));

        let unknown = handle_frame(&handle, conn_id, frame("shout", json!({}), None)).await;
        assert!(matches!(unknown, Some(ServerEvent::Error { .. })));

        let pong = handle_frame(&handle, conn_id, frame(EVENT_PING, json!(null), None)).await;
        assert_eq!(pong, Some(ServerEvent::Pong));
    }

    #[tokio::test]
    async fn typing_has_no_direct_reply() {
        let (handle, conn_id, _rx) = connected();
        let reply = handle_frame(
            &handle,
            conn_id,
            frame(EVENT_TYPING, json!({"conversationId": "c1", "userId": "u1", "isTyping": true}), None),
        )
        .await;
        assert_eq!(reply, None);
    }
}
