//! Relay transport for the sync endpoint.
//!
//! ## Protocol
//!
//! 1. Connect to the relay's `/ws` endpoint
//! 2. Send `experiment-join` or `web-join` with the room id
//! 3. Receive `joined` (or `conflict` if the room already has an experiment)
//! 4. Exchange `push`, `ack` and `request-state` events with the other role
//! 5. Events are JSON text frames

mod client;
mod error;
mod protocol;

pub use client::{RelayClient, RelayConnection};
pub use error::SyncError;
pub use protocol::{generate_connection_id, Event, Role};
