//! Event vocabulary exchanged with the relay server.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`. Events without a payload omit
//! `data`. The relay only looks at the event name; payloads are opaque to it.

use serde::{Deserialize, Serialize};

/// The two logical roles a connection can take inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The rig: sensors and actuators behind the device link.
    Experiment,
    /// A browser or remote operator.
    Web,
}

impl Role {
    /// Returns the role on the other side of a room.
    pub fn opposite(self) -> Role {
        match self {
            Role::Experiment => Role::Web,
            Role::Web => Role::Experiment,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Experiment => "experiment",
            Role::Web => "web",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events carried over a relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Event {
    /// Registers the sender as the experiment of a room (client -> server)
    ExperimentJoin(String),
    /// Registers the sender as a web client of a room (client -> server)
    WebJoin(String),
    /// Removes the sender from its room (client -> server)
    Leave,
    /// Proposed shared state. Either a JSON object or a string holding one.
    Push(serde_json::Value),
    /// A push was applied by the peer
    Ack,
    /// Asks the other role to re-push its current state
    RequestState,
    /// Join accepted (server -> client)
    Joined { room: String, role: Role },
    /// Join rejected because the room already has an experiment (server -> client)
    Conflict(String),
}

impl Event {
    /// Builds the join event for a role.
    pub fn join(role: Role, room: impl Into<String>) -> Self {
        match role {
            Role::Experiment => Event::ExperimentJoin(room.into()),
            Role::Web => Event::WebJoin(room.into()),
        }
    }

    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ExperimentJoin(_) => "experiment-join",
            Event::WebJoin(_) => "web-join",
            Event::Leave => "leave",
            Event::Push(_) => "push",
            Event::Ack => "ack",
            Event::RequestState => "request-state",
            Event::Joined { .. } => "joined",
            Event::Conflict(_) => "conflict",
        }
    }

    /// Encode event as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode event from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Generate a random connection ID.
pub fn generate_connection_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
