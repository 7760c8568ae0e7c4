use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};

use super::state::ChatState;
use crate::protocol::{AckPayload, ClientFrame, EVENT_JOIN, EVENT_PING, JoinPayload, ServerEvent};
use crate::types::UserId;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct Outgoing {
    pub frame: ClientFrame,
    pub ack_tx: Option<oneshot::Sender<AckPayload>>,
}

pub(crate) struct Connection {
    pub out_tx: mpsc::UnboundedSender<Outgoing>,
    pub task: JoinHandle<()>,
}

enum SessionEnd {
    /// The owning client went away; stop for good.
    Closed,
    /// Transport failure; reconnect after backoff.
    Dropped,
}

pub(crate) fn spawn(ws_url: String, user_id: UserId, state: Arc<watch::Sender<ChatState>>) -> Connection {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(ws_url, user_id, state, out_rx));
    Connection { out_tx, task }
}

async fn run(
    ws_url: String,
    user_id: UserId,
    state: Arc<watch::Sender<ChatState>>,
    mut out_rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match connect_async(ws_url.as_str()).await {
            Ok((socket, _)) => {
                log::info!("Realtime channel connected to {}", ws_url);
                backoff = INITIAL_BACKOFF;

                let end = session(socket, &user_id, &state, &mut out_rx).await;

                state.send_modify(|s| {
                    s.connected = false;
                    s.typing.clear();
                });
                if let SessionEnd::Closed = end {
                    log::debug!("Realtime channel closed by client");
                    return;
                }
                log::warn!("Realtime channel dropped, reconnecting in {:?}", backoff);
            }
            Err(e) => log::warn!("Realtime connect to {} failed: {}", ws_url, e),
        }

        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn session(
    socket: Socket,
    user_id: &str,
    state: &watch::Sender<ChatState>,
    out_rx: &mut mpsc::UnboundedReceiver<Outgoing>,
) -> SessionEnd {
    let (mut sink, mut source) = socket.split();
    // Acks that die with this socket drop their sender, which the waiter sees as a disconnect.
    let mut pending: HashMap<u64, oneshot::Sender<AckPayload>> = HashMap::new();

    let rooms: Vec<String> = state.borrow().joined.iter().cloned().collect();
    for conversation_id in rooms {
        let payload = JoinPayload {
            conversation_id,
            user_id: Some(user_id.to_string()),
        };
        let Ok(frame) = ClientFrame::new(EVENT_JOIN, &payload, None) else {
            continue;
        };
        if write_frame(&mut sink, &frame).await.is_err() {
            return SessionEnd::Dropped;
        }
    }

    // Re-joins are queued on the socket ahead of anything sent after this point.
    state.send_modify(|s| s.connected = true);

    let mut keepalive = interval(KEEPALIVE_INTERVAL);

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(Outgoing { frame, ack_tx }) = outgoing else {
                    let _ = sink.close().await;
                    return SessionEnd::Closed;
                };
                if let (Some(id), Some(tx)) = (frame.ack, ack_tx) {
                    pending.insert(id, tx);
                }
                if write_frame(&mut sink, &frame).await.is_err() {
                    return SessionEnd::Dropped;
                }
            }

            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(ServerEvent::MessageNew(message)) => {
                            state.send_modify(|s| {
                                s.merge_message(message);
                            });
                        }
                        Ok(ServerEvent::Typing(payload)) => {
                            state.send_modify(|s| s.apply_typing(payload));
                        }
                        Ok(ServerEvent::Ack(ack)) => {
                            if let Some(tx) = pending.remove(&ack.id) {
                                let _ = tx.send(ack);
                            }
                        }
                        Ok(ServerEvent::Error { message }) => log::warn!("Server error: {}", message),
                        Ok(ServerEvent::Pong) => {}
                        Err(e) => log::warn!("Undecodable server frame: {}", e),
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    log::info!("Server closed realtime channel: {:?}", frame);
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Realtime channel error: {}", e);
                    return SessionEnd::Dropped;
                }
                None => return SessionEnd::Dropped,
            },

            _ = keepalive.tick() => {
                let ping = ClientFrame {
                    event: EVENT_PING.to_string(),
                    data: serde_json::Value::Null,
                    ack: None,
                };
                if write_frame(&mut sink, &ping).await.is_err() {
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}

async fn write_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<(), ()>
where
    S: futures::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(frame).map_err(|e| log::error!("Failed to encode frame: {}", e))?;
    sink.send(WsMessage::text(json))
        .await
        .map_err(|e| log::warn!("Failed to write frame: {}", e))
}
