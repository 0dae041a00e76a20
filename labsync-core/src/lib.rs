//! labsync core library
//!
//! Keeps a small set of control variables consistent between an experiment
//! rig and its web clients over an unreliable relay.

pub mod endpoint;
pub mod sync;
pub mod timer;
pub mod variables;

pub use endpoint::{DeviceLink, EndpointConfig, EndpointError, Notification, Phase, SyncEndpoint};
pub use sync::{generate_connection_id, Event, RelayClient, RelayConnection, Role, SyncError};
pub use timer::{PausableTimer, Tick, TimerCallback, TimerError};
pub use variables::{InboundUpdate, PayloadError, Value, VariableStore, Variables};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
