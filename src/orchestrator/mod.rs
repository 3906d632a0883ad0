//! Child-side session state machine, §4.E.
//!
//! One instance per child process; serves at most one session in its
//! lifetime. The run loop selects over three independent termination
//! triggers (parent stop, target-left, idle) and applies whichever fires
//! first, in fixed priority order: stop beats target-left beats idle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::time::interval;
use tracing::{info, warn};

use crate::error::ErrorCode;

/// State machine phase (§4.E diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initializing,
    ConnectingAnam,
    ConnectingAgora,
    Connected,
    Streaming,
    Disconnecting,
    Disconnected,
    Failed,
}

/// Why the session is winding down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ParentStop,
    TargetLeft,
    Idle,
}

/// Shared, lock-protected state the run loop and the IPC command loop both
/// touch. Mirrors the `Arc<RwLock<Inner>>` shape used for per-session state
/// elsewhere in this crate.
pub struct Orchestrator {
    state: Mutex<State>,
    stop_rx: watch::Receiver<bool>,
    target_left_rx: watch::Receiver<bool>,
    last_audio_time: Mutex<Option<Instant>>,
    idle_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        stop_rx: watch::Receiver<bool>,
        target_left_rx: watch::Receiver<bool>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(State::Initializing),
            stop_rx,
            target_left_rx,
            last_audio_time: Mutex::new(None),
            idle_timeout,
        }
    }

    pub async fn state(&self) -> State {
        *self.state.lock().await
    }

    pub async fn transition(&self, next: State) {
        let mut state = self.state.lock().await;
        info!(from = ?*state, to = ?next, "orchestrator state transition");
        *state = next;
    }

    pub async fn note_audio_transmitted(&self, at: Instant) {
        *self.last_audio_time.lock().await = Some(at);
    }

    /// Block until one termination trigger fires. `biased;` makes the arm
    /// order below the actual priority order (stop > target_left > idle)
    /// instead of Tokio's default pseudo-random pick among ready arms
    /// (§4.E, §5 ordering guarantees).
    pub async fn wait_for_trigger(&self) -> Trigger {
        let mut stop_rx = self.stop_rx.clone();
        let mut target_left_rx = self.target_left_rx.clone();
        let mut idle_ticker = interval(Duration::from_secs(10));

        loop {
            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    if changed.is_ok() && *stop_rx.borrow() {
                        return Trigger::ParentStop;
                    }
                }
                changed = target_left_rx.changed() => {
                    if changed.is_ok() && *target_left_rx.borrow() {
                        return Trigger::TargetLeft;
                    }
                }
                _ = idle_ticker.tick() => {
                    let last = *self.last_audio_time.lock().await;
                    let idle_for = last.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                    if idle_for >= self.idle_timeout {
                        return Trigger::Idle;
                    }
                }
            }
        }
    }
}

impl Trigger {
    pub fn error_code(self) -> Option<ErrorCode> {
        match self {
            Trigger::ParentStop => None, // clean shutdown, not an error
            Trigger::TargetLeft => Some(ErrorCode::TargetLeft),
            Trigger::Idle => Some(ErrorCode::IdleTimeout),
        }
    }
}

/// Commands the IPC command loop translates `StartSession`/`StopSession`
/// frames into for the run loop to observe via `stop_tx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Start,
    Stop,
}

/// Owns the watch senders the command loop writes to and the orchestrator
/// reads from.
#[derive(Clone)]
pub struct CommandChannels {
    pub stop_tx: Arc<watch::Sender<bool>>,
    pub target_left_tx: Arc<watch::Sender<bool>>,
}

impl CommandChannels {
    pub fn new() -> (Self, watch::Receiver<bool>, watch::Receiver<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (target_left_tx, target_left_rx) = watch::channel(false);
        (
            Self {
                stop_tx: Arc::new(stop_tx),
                target_left_tx: Arc::new(target_left_tx),
            },
            stop_rx,
            target_left_rx,
        )
    }

    /// Apply one command decoded from an IPC frame (§4.E "Command loop").
    /// Unknown message types are logged and ignored by the caller before
    /// this is ever reached.
    pub fn apply(&self, cmd: Cmd) {
        match cmd {
            Cmd::Stop => {
                let _ = self.stop_tx.send(true);
            }
            Cmd::Start => {
                warn!("received StartSession on an already-initialized child; ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_stop_carries_no_error_code_but_the_others_do() {
        assert_eq!(Trigger::ParentStop.error_code(), None);
        assert_eq!(Trigger::TargetLeft.error_code(), Some(ErrorCode::TargetLeft));
        assert_eq!(Trigger::Idle.error_code(), Some(ErrorCode::IdleTimeout));
    }

    #[tokio::test]
    async fn wait_for_trigger_returns_as_soon_as_stop_fires() {
        let (channels, stop_rx, target_left_rx) = CommandChannels::new();
        let orchestrator = Orchestrator::new(stop_rx, target_left_rx, Duration::from_secs(60));
        channels.apply(Cmd::Stop);
        let trigger = tokio::time::timeout(Duration::from_secs(1), orchestrator.wait_for_trigger())
            .await
            .expect("trigger should fire promptly");
        assert_eq!(trigger, Trigger::ParentStop);
    }

    #[tokio::test]
    async fn stop_outranks_target_left_when_both_are_already_pending() {
        let (channels, stop_rx, target_left_rx) = CommandChannels::new();
        let orchestrator = Orchestrator::new(stop_rx, target_left_rx, Duration::from_secs(60));
        let _ = channels.target_left_tx.send(true);
        channels.apply(Cmd::Stop);
        let trigger = tokio::time::timeout(Duration::from_secs(1), orchestrator.wait_for_trigger())
            .await
            .expect("trigger should fire promptly");
        assert_eq!(trigger, Trigger::ParentStop);
    }

    #[tokio::test]
    async fn state_transitions_are_observable() {
        let (_channels, stop_rx, target_left_rx) = CommandChannels::new();
        let orchestrator = Orchestrator::new(stop_rx, target_left_rx, Duration::from_secs(60));
        assert_eq!(orchestrator.state().await, State::Initializing);
        orchestrator.transition(State::ConnectingAnam).await;
        assert_eq!(orchestrator.state().await, State::ConnectingAnam);
    }
}
