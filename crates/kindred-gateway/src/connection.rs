use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};

use kindred_types::events::{ConnectionId, RelayCommand, RelayEvent};

use crate::dispatcher::Dispatcher;
use crate::registry::Registration;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// GET /gateway
pub async fn ws_upgrade(
    State(dispatcher): State<Dispatcher>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, dispatcher))
}

/// Run one relay connection until either side closes it or the heartbeat
/// times out. Disconnect always unbinds the connection's identity.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut conn_rx) = dispatcher.open_connection().await;

    info!("connection {} opened", conn_id);

    // The client needs its id before it can register an identity
    let ready = RelayEvent::Ready {
        connection_id: conn_id,
    };
    if send_event(&mut sender, &ready).await.is_err() {
        dispatcher.close_connection(conn_id).await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward targeted events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = conn_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("connection {} missed {} pongs, dropping", conn_id, missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client. Commands of one connection are handled
    // strictly in arrival order.
    let dispatcher_recv = dispatcher.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<RelayCommand>(&text) {
                    Ok(cmd) => handle_command(&dispatcher_recv, conn_id, cmd).await,
                    Err(e) => {
                        warn!(
                            "connection {} bad command: {} -- raw: {}",
                            conn_id,
                            e,
                            truncate(&text, 200)
                        );
                    }
                },
                Message::Binary(data) => {
                    warn!("connection {} sent {} binary bytes, ignoring", conn_id, data.len());
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                Message::Ping(_) => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    match dispatcher.close_connection(conn_id).await {
        Some(username) => info!("{} disconnected (connection {})", username, conn_id),
        None => info!("connection {} closed", conn_id),
    }
}

/// Apply one client command. Unknown targets and unregistered senders are
/// logged and dropped, never fatal to the connection.
pub(crate) async fn handle_command(dispatcher: &Dispatcher, conn_id: ConnectionId, cmd: RelayCommand) {
    match cmd {
        RelayCommand::StoreUserSocketId {
            username,
            connection_id,
        } => {
            if connection_id != conn_id {
                warn!(
                    "connection {} tried to register {} for connection {}",
                    conn_id, username, connection_id
                );
                return;
            }
            if dispatcher.register(&username, conn_id).await == Registration::Ignored {
                debug!("connection {} sent a blank username", conn_id);
            }
        }

        RelayCommand::RemoveUserSocketId { username } => {
            // Only a session of the user may log the user out
            if dispatcher.username_of(conn_id).await.as_deref() != Some(username.as_str()) {
                warn!("connection {} is not {}, ignoring removal", conn_id, username);
                return;
            }
            dispatcher.remove_user(&username).await;
        }

        RelayCommand::UpdateUserSocketId {
            old_username,
            new_username,
            connection_id,
        } => {
            if connection_id != conn_id {
                warn!(
                    "connection {} tried to rename connection {}",
                    conn_id, connection_id
                );
                return;
            }
            match dispatcher.username_of(conn_id).await {
                Some(current) if current == old_username => {
                    dispatcher.rename(&old_username, &new_username, conn_id).await;
                }
                Some(current) => {
                    warn!(
                        "connection {} is {}, not {}; ignoring rename",
                        conn_id, current, old_username
                    );
                }
                None => {
                    dispatcher.register(&new_username, conn_id).await;
                }
            }
        }

        RelayCommand::UpdateNotificationCounter { username } => {
            let event = RelayEvent::GetUpdatedNotificationCounter {
                username: username.clone(),
            };
            dispatcher.send_to_user(&username, event, Some(conn_id)).await;
        }

        RelayCommand::ChatRequest { username } => {
            let Some(from_username) = dispatcher.username_of(conn_id).await else {
                debug!("unregistered connection {} sent chat-request", conn_id);
                return;
            };
            dispatcher
                .send_to_user(
                    &username,
                    RelayEvent::UpdateChatRequest { from_username },
                    Some(conn_id),
                )
                .await;
        }

        RelayCommand::UserTypingMsg { username, message } => {
            let Some(from_username) = dispatcher.username_of(conn_id).await else {
                return;
            };
            trace!(
                "{} typing to {} ({} chars)",
                from_username,
                username,
                message.chars().count()
            );
            dispatcher
                .send_to_user(
                    &username,
                    RelayEvent::UserIsTypingMsg {
                        username: from_username,
                        message,
                    },
                    Some(conn_id),
                )
                .await;
        }

        RelayCommand::SenderMessage { log, username } => {
            let Some(from_username) = dispatcher.username_of(conn_id).await else {
                debug!("unregistered connection {} sent sender-message", conn_id);
                return;
            };
            dispatcher
                .send_to_user(
                    &username,
                    RelayEvent::RecipientMessage { log, from_username },
                    Some(conn_id),
                )
                .await;
        }

        RelayCommand::ReceiveUpdateProfileRequest { username } => {
            dispatcher
                .send_to_user(&username, RelayEvent::ReceiveUpdateProfileRequest, Some(conn_id))
                .await;
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RelayEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sender.send(Message::Text(text.into())).await,
        Err(e) => {
            warn!("failed to encode {}: {}", event.name(), e);
            Ok(())
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
