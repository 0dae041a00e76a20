//! A pausable, resumable supervision timer.
//!
//! The timer owns a background task that holds the countdown. Callers drive it
//! with small commands (`resume`, `pause`, `stop`) sent over a channel, so the
//! timer can be controlled from any task while its callback always runs on the
//! timer's own task. Two firings of the same timer never overlap.
//!
//! While armed the timer is periodic: after each firing it starts a fresh
//! countdown of `interval`, unless the callback answers [`Tick::Pause`].

use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// What the timer does after its callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Start another full countdown
    Continue,
    /// Go dormant until resumed, as after `pause(true)`
    Pause,
}

/// Callback invoked each time the timer fires.
pub type TimerCallback = Box<dyn FnMut() -> BoxFuture<'static, Tick> + Send>;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("Timer requires a running Tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone, Copy)]
enum Command {
    Resume { now: bool },
    Pause { reset: bool },
    Stop,
}

/// Countdown state owned by the timer task.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Countdown {
    /// Dormant. `remaining` holds the rest of an interrupted countdown.
    Paused { remaining: Option<Duration> },
    /// Counting down towards `deadline`.
    Armed { deadline: Instant },
}

pub struct PausableTimer {
    interval: Duration,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PausableTimer {
    /// Creates a paused timer. Nothing fires until [`resume`](Self::resume).
    pub fn new(interval: Duration, callback: TimerCallback) -> Result<Self, TimerError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| TimerError::NoRuntime)?;
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = handle.spawn(run(interval, callback, receiver));

        Ok(Self {
            interval,
            commands,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arms the timer.
    ///
    /// With `now` the callback fires on the next scheduling opportunity and a
    /// new countdown follows. Otherwise a countdown of `interval` starts,
    /// restarting one that is already running. A countdown interrupted by
    /// `pause(false)` continues from where it stopped.
    pub fn resume(&self, now: bool) {
        self.send(Command::Resume { now });
    }

    /// Halts the countdown. With `reset` the remaining time is discarded so the
    /// next `resume(false)` waits a full `interval`.
    pub fn pause(&self, reset: bool) {
        self.send(Command::Pause { reset });
    }

    /// Fires the callback one last time and ends the timer task.
    ///
    /// Returns once the task has exited, including when another caller
    /// started the stop. Later commands are ignored.
    pub async fn stop(&self) {
        self.send(Command::Stop);
        // Held across the join so concurrent callers wait for the final firing.
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Timer task ended abnormally: {}", e);
            }
        }
    }

    /// Whether the timer task has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Ignoring {:?} on a stopped timer", command);
        }
    }
}

impl Drop for PausableTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn run(
    interval: Duration,
    mut callback: TimerCallback,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut countdown = Countdown::Paused { remaining: None };

    loop {
        let deadline = match countdown {
            Countdown::Armed { deadline } => Some(deadline),
            Countdown::Paused { .. } => None,
        };

        tokio::select! {
            biased;

            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    Command::Resume { now: true } => {
                        countdown = after(callback().await, interval);
                    }
                    Command::Resume { now: false } => {
                        let wait = match countdown {
                            Countdown::Paused { remaining: Some(remaining) } => remaining,
                            _ => interval,
                        };
                        countdown = Countdown::Armed { deadline: Instant::now() + wait };
                    }
                    Command::Pause { reset } => {
                        let remaining = match (countdown, reset) {
                            (_, true) => None,
                            (Countdown::Armed { deadline }, false) => {
                                Some(deadline.saturating_duration_since(Instant::now()))
                            }
                            (Countdown::Paused { remaining }, false) => remaining,
                        };
                        countdown = Countdown::Paused { remaining };
                    }
                    Command::Stop => {
                        callback().await;
                        break;
                    }
                }
            }

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                // Commands queued while the callback ran are applied on the next pass.
                countdown = after(callback().await, interval);
            }
        }
    }

    commands.close();
    tracing::debug!("Timer task finished");
}

fn after(tick: Tick, interval: Duration) -> Countdown {
    match tick {
        Tick::Continue => Countdown::Armed {
            deadline: Instant::now() + interval,
        },
        Tick::Pause => Countdown::Paused { remaining: None },
    }
}
