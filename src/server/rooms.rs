//! Room membership and event routing for the relay.
//!
//! A room pairs at most one experiment connection with any number of web
//! connections. Events from one role are forwarded to every member of the
//! other role in the same room; payloads are never inspected.

use labsync_core::{generate_connection_id, Event, Role};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE: usize = 64;

pub type ConnectionId = String;

#[derive(Debug, Error, PartialEq)]
pub enum RelayError {
    #[error("Room '{0}' already has an experiment")]
    ExperimentConflict(String),
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
}

/// A live connection and the room it joined, if any.
struct Connection {
    sender: mpsc::Sender<Event>,
    membership: Option<(String, Role)>,
}

#[derive(Default)]
struct Room {
    experiment: Option<ConnectionId>,
    web: HashSet<ConnectionId>,
}

impl Room {
    fn is_empty(&self) -> bool {
        self.experiment.is_none() && self.web.is_empty()
    }

    fn members(&self, role: Role) -> Vec<&ConnectionId> {
        match role {
            Role::Experiment => self.experiment.iter().collect(),
            Role::Web => self.web.iter().collect(),
        }
    }
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<String, Room>,
}

impl Registry {
    fn leave(&mut self, connection_id: &str) -> Option<(String, Role)> {
        let membership = self.connections.get_mut(connection_id)?.membership.take()?;
        let (room_id, role) = &membership;

        if let Some(room) = self.rooms.get_mut(room_id) {
            match role {
                Role::Experiment => {
                    if room.experiment.as_deref() == Some(connection_id) {
                        room.experiment = None;
                    }
                }
                Role::Web => {
                    room.web.remove(connection_id);
                }
            }
            if room.is_empty() {
                self.rooms.remove(room_id);
            }
        }

        Some(membership)
    }
}

/// Counts reported by the `/rooms` endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub rooms: Vec<RoomStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomStats {
    pub room: String,
    pub experiment: bool,
    pub web: usize,
}

/// Tracks live connections and their rooms.
///
/// Owned by the server and shared with every connection handler.
pub struct RoomRegistry {
    inner: RwLock<Registry>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
        }
    }

    /// Registers a new connection and returns its ID.
    pub async fn register(&self, sender: mpsc::Sender<Event>) -> ConnectionId {
        let connection_id = generate_connection_id();
        self.inner.write().await.connections.insert(
            connection_id.clone(),
            Connection {
                sender,
                membership: None,
            },
        );
        connection_id
    }

    /// Removes a connection and its room membership. Other members are not told.
    pub async fn unregister(&self, connection_id: &str) {
        let mut registry = self.inner.write().await;
        registry.leave(connection_id);
        registry.connections.remove(connection_id);
    }

    /// Puts a connection into a room under a role.
    ///
    /// A room keeps its first experiment: another connection claiming the
    /// experiment role is rejected until the first one leaves. A connection
    /// that already belongs to a room leaves it first.
    pub async fn join(
        &self,
        connection_id: &str,
        role: Role,
        room_id: &str,
    ) -> Result<(), RelayError> {
        let mut registry = self.inner.write().await;

        let connection = registry
            .connections
            .get(connection_id)
            .ok_or_else(|| RelayError::UnknownConnection(connection_id.to_string()))?;
        if connection.membership.as_ref() == Some(&(room_id.to_string(), role)) {
            return Ok(());
        }

        if role == Role::Experiment {
            let holder = registry
                .rooms
                .get(room_id)
                .and_then(|room| room.experiment.as_ref());
            if holder.is_some_and(|holder| holder != connection_id) {
                return Err(RelayError::ExperimentConflict(room_id.to_string()));
            }
        }

        registry.leave(connection_id);

        let room = registry.rooms.entry(room_id.to_string()).or_default();
        match role {
            Role::Experiment => room.experiment = Some(connection_id.to_string()),
            Role::Web => {
                room.web.insert(connection_id.to_string());
            }
        }
        if let Some(connection) = registry.connections.get_mut(connection_id) {
            connection.membership = Some((room_id.to_string(), role));
        }

        tracing::info!("Connection {} joined room {} as {}", connection_id, room_id, role);
        Ok(())
    }

    /// Removes a connection from its room without disconnecting it.
    pub async fn leave(&self, connection_id: &str) {
        if let Some((room_id, role)) = self.inner.write().await.leave(connection_id) {
            tracing::info!("Connection {} left room {} ({})", connection_id, room_id, role);
        }
    }

    /// Forwards an event from `source` to the other role of its room.
    ///
    /// Pushes keep their payload; acknowledgements and state requests carry
    /// none. Events from connections outside any room are dropped. Returns
    /// the number of connections the event was queued for.
    pub async fn relay(&self, source: &str, event: Event) -> usize {
        let forwarded = match event {
            Event::Push(payload) => Event::Push(payload),
            Event::Ack => Event::Ack,
            Event::RequestState => Event::RequestState,
            other => {
                tracing::debug!("Not relaying {} event", other.name());
                return 0;
            }
        };

        let registry = self.inner.read().await;
        let Some((room_id, role)) = registry
            .connections
            .get(source)
            .and_then(|connection| connection.membership.as_ref())
        else {
            tracing::debug!(
                "Dropping {} from {}: not in a room",
                forwarded.name(),
                source
            );
            return 0;
        };
        let Some(room) = registry.rooms.get(room_id) else {
            return 0;
        };

        let mut delivered = 0;
        for target in room.members(role.opposite()) {
            let Some(connection) = registry.connections.get(target) else {
                continue;
            };
            match connection.sender.try_send(forwarded.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Outbound queue full for {}, dropping {}", target, forwarded.name());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("Connection {} already closed", target);
                }
            }
        }

        tracing::debug!(
            "Relayed {} in room {} from {} to {} connection(s)",
            forwarded.name(),
            room_id,
            role,
            delivered
        );
        delivered
    }

    pub async fn stats(&self) -> RegistryStats {
        let registry = self.inner.read().await;
        let mut rooms: Vec<RoomStats> = registry
            .rooms
            .iter()
            .map(|(room_id, room)| RoomStats {
                room: room_id.clone(),
                experiment: room.experiment.is_some(),
                web: room.web.len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room.cmp(&b.room));

        RegistryStats {
            connections: registry.connections.len(),
            rooms,
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
