//! WebSocket client for the labsync relay server.
//!
//! The client joins a room under a role, then runs a dispatch loop that
//! forwards the endpoint's outbound events to the relay and feeds events from
//! the relay into the endpoint.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::error::SyncError;
use super::protocol::{Event, Role};
use crate::endpoint::SyncEndpoint;

/// Timeout for the relay to answer a join.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client for connecting to the relay server.
#[derive(Debug, Clone)]
pub struct RelayClient {
    server_url: String,
}

impl RelayClient {
    pub fn new(server_url: String) -> Self {
        Self { server_url }
    }

    /// Returns the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Opens a connection and joins `room` as `role`.
    pub async fn connect(&self, role: Role, room: &str) -> Result<RelayConnection, SyncError> {
        let ws_url = self.build_ws_url();
        let (mut stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| SyncError::ConnectionError(e.to_string()))?;

        tracing::info!("Connected to relay at {}", ws_url);
        join(&mut stream, role, room).await?;

        Ok(RelayConnection {
            stream,
            role,
            room: room.to_string(),
        })
    }

    /// Builds the WebSocket URL for the relay endpoint.
    fn build_ws_url(&self) -> String {
        // Convert http(s) to ws(s) if needed
        let base_url = if self.server_url.starts_with("http://") {
            self.server_url.replace("http://", "ws://")
        } else if self.server_url.starts_with("https://") {
            self.server_url.replace("https://", "wss://")
        } else if !self.server_url.starts_with("ws://") && !self.server_url.starts_with("wss://") {
            format!("ws://{}", self.server_url)
        } else {
            self.server_url.clone()
        };

        format!("{}/ws", base_url.trim_end_matches('/'))
    }
}

/// Sends the join event and waits for the relay's answer.
async fn join(stream: &mut WsStream, role: Role, room: &str) -> Result<(), SyncError> {
    send(stream, &Event::join(role, room)).await?;

    let answer = timeout(JOIN_TIMEOUT, async {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => match Event::decode(text.as_str()) {
                    Ok(Event::Joined { room, role }) => {
                        tracing::info!("Joined room {} as {}", room, role);
                        return Ok(());
                    }
                    Ok(Event::Conflict(message)) => return Err(SyncError::JoinRejected(message)),
                    Ok(other) => {
                        tracing::debug!("Ignoring {} before join completed", other.name());
                    }
                    Err(e) => return Err(SyncError::ProtocolError(e.to_string())),
                },
                Ok(Message::Close(_)) => {
                    return Err(SyncError::ConnectionError(
                        "Relay closed connection during join".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => return Err(SyncError::WebSocketError(e.to_string())),
            }
        }
        Err(SyncError::ConnectionError(
            "Connection closed before join completed".to_string(),
        ))
    })
    .await;

    match answer {
        Ok(result) => result,
        Err(_) => Err(SyncError::JoinTimeout),
    }
}

async fn send<S>(sink: &mut S, event: &Event) -> Result<(), SyncError>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = event
        .encode()
        .map_err(|e| SyncError::ProtocolError(e.to_string()))?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| SyncError::WebSocketError(e.to_string()))
}

/// A joined relay connection.
pub struct RelayConnection {
    stream: WsStream,
    role: Role,
    room: String,
}

impl RelayConnection {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Runs the dispatch loop until either side closes.
    ///
    /// `outbound` is the receiving half of the channel given to the endpoint.
    /// A web endpoint asks for the current state as soon as the loop starts.
    pub async fn run(
        self,
        endpoint: &SyncEndpoint,
        mut outbound: mpsc::Receiver<Event>,
    ) -> Result<(), SyncError> {
        let (mut sender, mut receiver) = self.stream.split();

        if self.role == Role::Web {
            endpoint.request_state();
        }

        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    send(&mut sender, &event).await?;
                }

                msg = receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => match Event::decode(text.as_str()) {
                            Ok(event) => {
                                // Endpoint errors are logged where they occur.
                                let _ = endpoint.handle(event).await;
                            }
                            Err(e) => tracing::warn!("Dropping undecodable frame: {}", e),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            sender
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| SyncError::WebSocketError(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("Relay closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(SyncError::WebSocketError(e.to_string())),
                    }
                }
            }
        }

        let _ = sender.send(Message::Close(None)).await;
        Ok(())
    }
}
