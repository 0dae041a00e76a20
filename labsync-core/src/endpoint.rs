//! Supervised variable synchronization between an experiment and the web.
//!
//! Whichever side changes a variable pushes the whole state and waits for the
//! peer's acknowledgement. If none arrives within the supervision interval the
//! change is rolled back to the last acknowledged snapshot. The side receiving
//! a push trusts it immediately and only acknowledges it.
//!
//! Once a locking push has been acknowledged the supervision timer keeps
//! running as a heartbeat: each window clears the confirmation flag, so a
//! window that lapses with no acknowledgement at all reports the peer as
//! silent.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

use crate::sync::{Event, Role};
use crate::timer::{PausableTimer, Tick, TimerError};
use crate::variables::{InboundUpdate, PayloadError, Value, VariableStore, Variables};

/// Buffer of the state notification channel.
const NOTIFICATION_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Variables are disabled")]
    Disabled,
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] PayloadError),
    #[error("Failed to start supervision timer: {0}")]
    Timer(#[from] TimerError),
}

/// Receives state written by the endpoint, e.g. a serial-attached board.
pub trait DeviceLink: Send + Sync {
    fn write(&self, state: &str) -> std::io::Result<()>;
}

/// Endpoint settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub role: Role,
    /// Supervision window
    pub interval: Duration,
    /// Initial state
    pub variables: Variables,
}

/// Where the endpoint is in the push/acknowledge cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No push awaiting acknowledgement
    Idle,
    /// A locking push is in flight
    Pending,
}

/// State change notifications for UI collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Current variables changed
    Changed(Variables),
    /// A locking push was sent; controls should be disabled
    Locked,
    /// The peer acknowledged the current state
    Confirmed,
    /// A locking push was not acknowledged in time and was discarded
    RolledBack,
    /// A heartbeat window lapsed without any acknowledgement
    PeerSilent,
}

struct Shared {
    store: VariableStore,
    phase: Phase,
    /// Start of the supervision window of the pending push
    window_started: Option<Instant>,
    /// Set once a locking push was made; cleared when supervision goes dormant
    heartbeat: bool,
}

struct Inner {
    role: Role,
    interval: Duration,
    state: Mutex<Shared>,
    outbound: mpsc::Sender<Event>,
    notifications: broadcast::Sender<Notification>,
    device: Option<Arc<dyn DeviceLink>>,
}

impl Inner {
    fn emit(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.outbound.try_send(event) {
            tracing::warn!("Dropping outbound {} event: {}", name, e);
        }
    }

    fn notify(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
    }

    fn push(&self, variables: &Variables) {
        match serde_json::to_value(variables) {
            Ok(payload) => self.emit(Event::Push(payload)),
            Err(e) => tracing::error!("Failed to serialize variables: {}", e),
        }
    }

    fn write_device(&self, store: &VariableStore) {
        if let Some(device) = &self.device {
            if let Err(e) = device.write(&store.to_json()) {
                tracing::warn!("Failed to write state to device: {}", e);
            }
        }
    }
}

/// One side of the synchronization protocol.
pub struct SyncEndpoint {
    inner: Arc<Inner>,
    timer: PausableTimer,
}

impl SyncEndpoint {
    /// Creates an endpoint whose outbound events go to `outbound`.
    ///
    /// Fails only if the supervision timer cannot be started.
    pub fn new(
        config: EndpointConfig,
        outbound: mpsc::Sender<Event>,
        device: Option<Arc<dyn DeviceLink>>,
    ) -> Result<Self, EndpointError> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let inner = Arc::new(Inner {
            role: config.role,
            interval: config.interval,
            state: Mutex::new(Shared {
                store: VariableStore::new(config.variables),
                phase: Phase::Idle,
                window_started: None,
                heartbeat: false,
            }),
            outbound,
            notifications,
            device,
        });

        let supervised = inner.clone();
        let timer = PausableTimer::new(
            config.interval,
            Box::new(move || supervise(supervised.clone()).boxed()),
        )?;

        Ok(Self { inner, timer })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub async fn snapshot(&self) -> Variables {
        self.inner.state.lock().await.store.snapshot()
    }

    pub async fn backup(&self) -> Variables {
        self.inner.state.lock().await.store.backup().clone()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().await.store.get(key).cloned()
    }

    pub async fn phase(&self) -> Phase {
        self.inner.state.lock().await.phase
    }

    /// True while a locking push awaits acknowledgement.
    pub async fn is_locked(&self) -> bool {
        self.phase().await == Phase::Pending
    }

    pub async fn is_confirmed(&self) -> bool {
        self.inner.state.lock().await.store.is_confirmed()
    }

    pub async fn set_enabled(&self, enabled: bool) {
        self.inner.state.lock().await.store.set_enabled(enabled);
    }

    /// Changes one variable locally and pushes the new state.
    ///
    /// With `lock` the push is supervised: it must be acknowledged within the
    /// interval or it is rolled back. A change made while a push is already
    /// pending joins that push's window.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
        lock: bool,
    ) -> Result<(), EndpointError> {
        let mut state = self.inner.state.lock().await;
        if !state.store.is_enabled() {
            return Err(EndpointError::Disabled);
        }

        state.store.set(key, value);
        self.inner.write_device(&state.store);
        self.commit_local(&mut state, lock);
        Ok(())
    }

    /// Handles data emitted by the device link.
    ///
    /// Text containing `$` is a log line from the device and is only logged.
    /// Anything else is what the hardware now holds: it is merged into both
    /// the current state and the backup, then pushed with locking. A lapsed
    /// window therefore never reverts it.
    pub async fn device_data(&self, data: InboundUpdate) -> Result<(), EndpointError> {
        if let InboundUpdate::Raw(text) = &data {
            if text.contains('$') {
                tracing::info!("Device: {}", text.trim());
                return Ok(());
            }
        }

        let changes = data.into_variables().inspect_err(|e| {
            tracing::warn!("Ignoring malformed device data: {}", e);
        })?;

        let mut state = self.inner.state.lock().await;
        state.store.report(changes);
        self.commit_local(&mut state, true);
        Ok(())
    }

    fn commit_local(&self, state: &mut Shared, lock: bool) {
        if lock && state.phase == Phase::Idle {
            state.phase = Phase::Pending;
            state.window_started = Some(Instant::now());
            state.heartbeat = true;
            self.timer.resume(false);
            self.inner.notify(Notification::Locked);
        }

        self.inner.push(state.store.current());
        self.inner
            .notify(Notification::Changed(state.store.snapshot()));
    }

    /// The peer acknowledged our last push.
    pub async fn acknowledged(&self) {
        let mut state = self.inner.state.lock().await;
        state.store.confirm();
        state.phase = Phase::Idle;
        state.window_started = None;
        // Keep supervising so a silent peer is noticed. An ack for an
        // unsupervised push (e.g. a state re-push) starts nothing.
        if state.heartbeat {
            self.timer.resume(false);
        }
        self.inner.notify(Notification::Confirmed);
        tracing::debug!("{} state confirmed by peer", self.inner.role);
    }

    /// Applies state pushed by the peer and acknowledges it.
    ///
    /// Malformed payloads are rejected without touching the state.
    pub async fn update(&self, data: InboundUpdate) -> Result<(), EndpointError> {
        let variables = data.into_variables().inspect_err(|e| {
            tracing::warn!("Ignoring malformed update from peer: {}", e);
        })?;

        let mut state = self.inner.state.lock().await;
        state.store.apply(variables);
        self.inner.write_device(&state.store);
        self.inner.emit(Event::Ack);
        self.inner
            .notify(Notification::Changed(state.store.snapshot()));
        Ok(())
    }

    /// Asks the peer to push its current state.
    pub fn request_state(&self) {
        self.inner.emit(Event::RequestState);
    }

    /// Re-pushes the current state without supervision.
    pub async fn push_current(&self) {
        let state = self.inner.state.lock().await;
        self.inner.push(state.store.current());
    }

    /// Dispatches an event received from the relay.
    pub async fn handle(&self, event: Event) -> Result<(), EndpointError> {
        match event {
            Event::Push(payload) => self.update(payload.into()).await?,
            Event::Ack => self.acknowledged().await,
            Event::RequestState => self.push_current().await,
            Event::Joined { room, role } => {
                tracing::info!("Joined room {} as {}", room, role);
            }
            Event::Conflict(message) => {
                tracing::warn!("Relay rejected join: {}", message);
            }
            other => {
                tracing::debug!("Ignoring {} event from relay", other.name());
            }
        }
        Ok(())
    }

    /// Stops supervision for good.
    pub async fn shutdown(&self) {
        self.timer.stop().await;
    }
}

/// Supervision callback, run on the timer task.
async fn supervise(inner: Arc<Inner>) -> Tick {
    let mut state = inner.state.lock().await;

    // A tick that raced with the start of a new window belongs to the old one.
    if let Some(started) = state.window_started {
        if started.elapsed() < inner.interval {
            return Tick::Continue;
        }
    }

    if state.store.is_confirmed() {
        state.store.reset_confirmation();
        return Tick::Continue;
    }

    let was_pending = state.phase == Phase::Pending;
    let changed = state.store.restore();
    state.phase = Phase::Idle;
    state.window_started = None;
    state.heartbeat = false;

    if was_pending {
        tracing::warn!(
            "{} push not acknowledged within {:?}, rolled back",
            inner.role,
            inner.interval
        );
        inner.notify(Notification::RolledBack);
    } else {
        tracing::info!("No acknowledgement from peer within {:?}", inner.interval);
        inner.notify(Notification::PeerSilent);
    }
    if changed {
        inner.write_device(&state.store);
        inner.notify(Notification::Changed(state.store.snapshot()));
    }

    Tick::Pause
}
