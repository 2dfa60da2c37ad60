use std::future;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};

use parley_chat::{ChatService, ChatStore};
use parley_types::api::Claims;
use parley_types::events::{GatewayCommand, GatewayEvent};

use crate::session::GatewaySession;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The token was validated
/// at the HTTP upgrade, so this goes straight to Ready and the event loop.
pub async fn handle_connection<S: ChatStore>(socket: WebSocket, chat: ChatService<S>, claims: Claims) {
    let (mut sender, mut receiver) = socket.split();
    let identity = claims.identity();

    info!("{} ({}) connected to gateway", identity.display_name, identity.user_id);

    let (mut session, mut updates) = GatewaySession::new(chat, identity.clone());
    if !send_event(&mut sender, &session.ready()).await {
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut pong_received = true;
    let mut missed_heartbeats: u8 = 0;

    loop {
        let typing_deadline = session.next_typing_deadline();

        tokio::select! {
            incoming = receiver.next() => {
                let msg = match incoming {
                    Some(Ok(msg)) => msg,
                    _ => break,
                };
                match msg {
                    WsMessage::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                        Ok(cmd) => {
                            if let Some(event) = session.handle_command(cmd, Instant::now()).await {
                                if !send_event(&mut sender, &event).await {
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                identity.display_name,
                                identity.user_id,
                                e,
                                text.chars().take(200).collect::<String>()
                            );
                        }
                    },
                    WsMessage::Pong(_) => pong_received = true,
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                if let Some(event) = session.apply(update) {
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
            }
            _ = sleep_until(typing_deadline) => {
                session.poll_typing(Instant::now()).await;
            }
            _ = heartbeat.tick() => {
                if std::mem::replace(&mut pong_received, false) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close().await;
    info!("{} ({}) disconnected from gateway", identity.display_name, identity.user_id);
}

/// Serialize and send one event. `false` means the socket is gone.
async fn send_event(sender: &mut SplitSink<WebSocket, WsMessage>, event: &GatewayEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            return true;
        }
    };
    sender.send(WsMessage::Text(text.into())).await.is_ok()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => future::pending().await,
    }
}
