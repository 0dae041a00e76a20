//! WebSocket connection handler for the relay.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use labsync_core::{Event, Role};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::rooms::{RelayError, RoomRegistry, OUTBOUND_QUEUE};
use super::AppState;

/// WebSocket upgrade handler
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.rooms))
}

async fn handle_socket(socket: WebSocket, rooms: Arc<RoomRegistry>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
    let connection_id = rooms.register(tx).await;

    info!("Relay connection opened: {}", connection_id);

    loop {
        tokio::select! {
            // Handle incoming messages from client
            Some(msg) = ws_rx.next() => {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(reply) = handle_frame(&rooms, &connection_id, text.as_str()).await {
                            if let Err(e) = send_event(&mut ws_tx, &reply).await {
                                error!("Failed to send {} reply: {}", reply.name(), e);
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            error!("Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("Client requested close");
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Events relayed from the other role of the room
            Some(event) = rx.recv() => {
                if let Err(e) = send_event(&mut ws_tx, &event).await {
                    error!("Failed to forward {}: {}", event.name(), e);
                    break;
                }
            }

            else => break,
        }
    }

    rooms.unregister(&connection_id).await;
    info!("Relay connection closed: {}", connection_id);
}

/// Applies one client frame. Returns a reply for the sender, if any.
async fn handle_frame(rooms: &RoomRegistry, connection_id: &str, text: &str) -> Option<Event> {
    let event = match Event::decode(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("Dropping undecodable frame from {}: {}", connection_id, e);
            return None;
        }
    };

    match event {
        Event::ExperimentJoin(room) => join(rooms, connection_id, Role::Experiment, room).await,
        Event::WebJoin(room) => join(rooms, connection_id, Role::Web, room).await,
        Event::Leave => {
            rooms.leave(connection_id).await;
            None
        }
        other => {
            rooms.relay(connection_id, other).await;
            None
        }
    }
}

async fn join(rooms: &RoomRegistry, connection_id: &str, role: Role, room: String) -> Option<Event> {
    match rooms.join(connection_id, role, &room).await {
        Ok(()) => Some(Event::Joined { room, role }),
        Err(e @ RelayError::ExperimentConflict(_)) => {
            warn!("Rejected join from {}: {}", connection_id, e);
            Some(Event::Conflict(e.to_string()))
        }
        Err(e) => {
            error!("Join failed for {}: {}", connection_id, e);
            None
        }
    }
}

async fn send_event<S>(sink: &mut S, event: &Event) -> Result<(), axum::Error>
where
    S: SinkExt<Message, Error = axum::Error> + Unpin,
{
    let text = match event.encode() {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode {}: {}", event.name(), e);
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handle_frame_join_and_relay() {
        let rooms = RoomRegistry::new();
        let (exp_tx, _exp_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (web_tx, mut web_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let exp = rooms.register(exp_tx).await;
        let web = rooms.register(web_tx).await;

        let reply = handle_frame(&rooms, &exp, r#"{"event":"experiment-join","data":"r"}"#).await;
        assert_eq!(
            reply,
            Some(Event::Joined {
                room: "r".to_string(),
                role: Role::Experiment
            })
        );
        handle_frame(&rooms, &web, r#"{"event":"web-join","data":"r"}"#).await;

        let reply = handle_frame(&rooms, &exp, r#"{"event":"push","data":{"btn1":true}}"#).await;
        assert!(reply.is_none());
        assert_eq!(web_rx.try_recv().unwrap(), Event::Push(json!({"btn1": true})));
    }

    #[tokio::test]
    async fn test_handle_frame_conflict_reply() {
        let rooms = RoomRegistry::new();
        let (tx1, _rx1) = mpsc::channel(OUTBOUND_QUEUE);
        let (tx2, _rx2) = mpsc::channel(OUTBOUND_QUEUE);
        let first = rooms.register(tx1).await;
        let second = rooms.register(tx2).await;

        let join = r#"{"event":"experiment-join","data":"r"}"#;
        handle_frame(&rooms, &first, join).await;
        let reply = handle_frame(&rooms, &second, join).await;
        assert!(matches!(reply, Some(Event::Conflict(_))));
    }

    #[tokio::test]
    async fn test_handle_frame_garbage() {
        let rooms = RoomRegistry::new();
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        let conn = rooms.register(tx).await;
        assert!(handle_frame(&rooms, &conn, "{{{").await.is_none());
    }
}
