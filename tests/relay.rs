//! Relay integration tests.
//!
//! These tests run the relay router on a random local port and talk to it
//! over real WebSocket connections, first with raw protocol frames and then
//! with two full sync endpoints.
//!
//! ```text
//! ┌──────────────┐     WebSocket     ┌─────────┐     WebSocket     ┌──────────────┐
//! │  experiment  │ ←───────────────→ │  relay  │ ←───────────────→ │  web client  │
//! └──────────────┘                   └─────────┘                   └──────────────┘
//! ```

use futures::{SinkExt, StreamExt};
use labsync::server::{app, RoomRegistry};
use labsync_core::{
    EndpointConfig, Event, Notification, RelayClient, Role, SyncEndpoint, Value, Variables,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE: Duration = Duration::from_millis(200);

// =============================================================================
// Test Infrastructure
// =============================================================================

/// Start the relay on a random available port
async fn start_relay() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().unwrap();
    let router = app(Arc::new(RoomRegistry::new()));

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (stream, _) = connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect to relay");
    stream
}

async fn send(client: &mut Client, event: &Event) {
    let text = event.encode().unwrap();
    client.send(Message::Text(text.into())).await.unwrap();
}

/// Next protocol event, skipping control frames
async fn recv(client: &mut Client) -> Event {
    timeout(RECV_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return Event::decode(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("Connection ended unexpectedly: {:?}", other),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

async fn assert_silent(client: &mut Client) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(SILENCE, client.next()).await {
        panic!("Expected no event, got {}", text);
    }
}

async fn joined(addr: SocketAddr, role: Role, room: &str) -> Client {
    let mut client = connect(addr).await;
    send(&mut client, &Event::join(role, room)).await;
    assert_eq!(
        recv(&mut client).await,
        Event::Joined {
            room: room.to_string(),
            role
        }
    );
    client
}

// =============================================================================
// Relay routing
// =============================================================================

#[tokio::test]
async fn test_push_reaches_web_members_of_same_room_only() {
    let addr = start_relay().await;
    let mut experiment = joined(addr, Role::Experiment, "room-x").await;
    let mut web_a = joined(addr, Role::Web, "room-x").await;
    let mut web_b = joined(addr, Role::Web, "room-x").await;
    let mut other_room = joined(addr, Role::Web, "room-y").await;

    let push = Event::Push(json!({"btn1": true, "btn2": false}));
    send(&mut experiment, &push).await;

    assert_eq!(recv(&mut web_a).await, push);
    assert_eq!(recv(&mut web_b).await, push);
    assert_silent(&mut other_room).await;
    // No echo back to the sender
    assert_silent(&mut experiment).await;
}

#[tokio::test]
async fn test_ack_routed_to_experiment() {
    let addr = start_relay().await;
    let mut experiment = joined(addr, Role::Experiment, "room-x").await;
    let mut web_a = joined(addr, Role::Web, "room-x").await;
    let mut web_b = joined(addr, Role::Web, "room-x").await;

    send(&mut web_a, &Event::Ack).await;

    assert_eq!(recv(&mut experiment).await, Event::Ack);
    assert_silent(&mut web_b).await;
}

#[tokio::test]
async fn test_second_experiment_rejected() {
    let addr = start_relay().await;
    let mut first = joined(addr, Role::Experiment, "room-x").await;
    let mut web = joined(addr, Role::Web, "room-x").await;

    let mut second = connect(addr).await;
    send(&mut second, &Event::join(Role::Experiment, "room-x")).await;
    assert!(matches!(recv(&mut second).await, Event::Conflict(_)));

    // The rejected connection is not a member of the room
    send(&mut second, &Event::Push(json!({"btn1": true}))).await;
    assert_silent(&mut web).await;

    // The first experiment is unaffected
    send(&mut web, &Event::Ack).await;
    assert_eq!(recv(&mut first).await, Event::Ack);
}

#[tokio::test]
async fn test_unjoined_connection_is_dropped() {
    let addr = start_relay().await;
    let mut web = joined(addr, Role::Web, "room-x").await;
    let mut stranger = connect(addr).await;

    send(&mut stranger, &Event::Push(json!({"btn1": true}))).await;
    assert_silent(&mut web).await;
}

#[tokio::test]
async fn test_leave_stops_delivery() {
    let addr = start_relay().await;
    let mut experiment = joined(addr, Role::Experiment, "room-x").await;
    let mut web = joined(addr, Role::Web, "room-x").await;

    send(&mut web, &Event::Leave).await;
    // Give the relay a moment to process the leave
    tokio::time::sleep(Duration::from_millis(50)).await;

    send(&mut experiment, &Event::Push(json!({"btn1": true}))).await;
    assert_silent(&mut web).await;
}

#[tokio::test]
async fn test_experiment_slot_freed_on_disconnect() {
    let addr = start_relay().await;
    let first = joined(addr, Role::Experiment, "room-x").await;
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = connect(addr).await;
    send(&mut second, &Event::join(Role::Experiment, "room-x")).await;
    assert!(matches!(recv(&mut second).await, Event::Joined { .. }));
}

// =============================================================================
// Endpoints over the relay
// =============================================================================

fn buttons() -> Variables {
    ["btn1", "btn2", "btn3"]
        .into_iter()
        .map(|name| (name.to_string(), Value::Bool(false)))
        .collect()
}

async fn start_endpoint(addr: SocketAddr, role: Role) -> Arc<SyncEndpoint> {
    let (tx, rx) = mpsc::channel(64);
    let endpoint = Arc::new(
        SyncEndpoint::new(
            EndpointConfig {
                role,
                interval: Duration::from_secs(5),
                variables: buttons(),
            },
            tx,
            None,
        )
        .unwrap(),
    );

    let connection = RelayClient::new(format!("ws://{}", addr))
        .connect(role, "room-x")
        .await
        .unwrap();

    let mut events = endpoint.subscribe();
    let running = endpoint.clone();
    tokio::spawn(async move {
        let _ = connection.run(&running, rx).await;
    });

    // A web endpoint starts by pulling the experiment's state
    if role == Role::Web {
        wait_for(&mut events, Notification::Changed(buttons())).await;
    }

    endpoint
}

async fn wait_for(
    notifications: &mut tokio::sync::broadcast::Receiver<Notification>,
    expected: Notification,
) {
    timeout(RECV_TIMEOUT, async {
        loop {
            if notifications.recv().await.unwrap() == expected {
                return;
            }
        }
    })
    .await
    .expect("Timed out waiting for notification")
}

#[tokio::test]
async fn test_web_change_confirmed_by_experiment() {
    let addr = start_relay().await;
    let experiment = start_endpoint(addr, Role::Experiment).await;
    let web = start_endpoint(addr, Role::Web).await;

    let mut web_events = web.subscribe();
    web.set("btn2", true, true).await.unwrap();
    assert!(web.is_locked().await);

    wait_for(&mut web_events, Notification::Confirmed).await;

    assert!(!web.is_locked().await);
    assert_eq!(experiment.get("btn2").await, Some(Value::Bool(true)));
    assert_eq!(web.backup().await, experiment.snapshot().await);

    experiment.shutdown().await;
    web.shutdown().await;
}

#[tokio::test]
async fn test_experiment_change_reaches_web() {
    let addr = start_relay().await;
    let experiment = start_endpoint(addr, Role::Experiment).await;
    let web = start_endpoint(addr, Role::Web).await;

    experiment.set("btn3", true, true).await.unwrap();

    timeout(RECV_TIMEOUT, async {
        while experiment.is_locked().await || web.get("btn3").await != Some(Value::Bool(true)) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for confirmation");
    assert!(experiment.is_confirmed().await);

    experiment.shutdown().await;
    web.shutdown().await;
}
