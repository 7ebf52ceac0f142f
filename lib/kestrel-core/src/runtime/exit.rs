use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use slab::Slab;
use snafu::Snafu;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

/// Drain error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DrainError {
    /// Participants were still registered when the drain deadline passed.
    #[snafu(display("Timed out after {:?} waiting for {} participant(s) to drain: {}", deadline, pending.len(), pending.join(", ")))]
    Timeout {
        /// How long the drain waited.
        deadline: Duration,

        /// Names of the participants that had not drained.
        pending: Vec<String>,
    },
}

struct State {
    exit_tx: watch::Sender<bool>,
    participants: Mutex<Slab<String>>,
    drained: Notify,
}

impl State {
    fn pending(&self) -> Vec<String> {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }
}

/// Process-wide exit broadcast paired with a drain barrier.
///
/// Long-running tasks [`register`][Self::register] to receive a [`DrainGuard`], watch its exit signal, and drop the
/// guard once they have finished their final work. The process calls [`trigger`][Self::trigger] once and then waits
/// for every guard to be dropped with [`wait_for_drain`][Self::wait_for_drain].
#[derive(Clone)]
pub struct ExitCoordinator {
    state: Arc<State>,
}

impl ExitCoordinator {
    /// Creates a new coordinator in the running state.
    pub fn new() -> Self {
        let (exit_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(State {
                exit_tx,
                participants: Mutex::new(Slab::new()),
                drained: Notify::new(),
            }),
        }
    }

    /// Returns a handle to the exit signal.
    pub fn signal(&self) -> ExitSignal {
        ExitSignal {
            exit_rx: self.state.exit_tx.subscribe(),
        }
    }

    /// Registers a participant that must drain before shutdown completes.
    pub fn register<S: Into<String>>(&self, name: S) -> DrainGuard {
        let name = name.into();
        debug!(participant = %name, "Registered drain participant.");
        let key = self
            .state
            .participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name);

        DrainGuard {
            key,
            state: Arc::clone(&self.state),
            signal: self.signal(),
        }
    }

    /// Broadcasts the exit signal.
    ///
    /// Calling this more than once has no further effect.
    pub fn trigger(&self) {
        let was_triggered = self.state.exit_tx.send_replace(true);
        if !was_triggered {
            info!("Exit signal triggered.");
        }
    }

    /// Returns `true` if the exit signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.state.exit_tx.borrow()
    }

    /// Returns the names of participants that have not yet drained.
    pub fn pending(&self) -> Vec<String> {
        self.state.pending()
    }

    /// Waits until every registered participant has drained, or `deadline` elapses.
    ///
    /// # Errors
    ///
    /// If participants remain after `deadline`, an error naming them is returned.
    pub async fn wait_for_drain(&self, deadline: Duration) -> Result<(), DrainError> {
        let wait = async {
            loop {
                let notified = self.state.drained.notified();
                if self.state.participants.lock().unwrap_or_else(PoisonError::into_inner).is_empty() {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(()) => Ok(()),
            Err(_) => Err(DrainError::Timeout {
                deadline,
                pending: self.state.pending(),
            }),
        }
    }
}

impl fmt::Debug for ExitCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitCoordinator")
            .field("triggered", &self.is_triggered())
            .field("pending", &self.pending())
            .finish()
    }
}

/// A receiver of the process-wide exit signal.
#[derive(Clone, Debug)]
pub struct ExitSignal {
    exit_rx: watch::Receiver<bool>,
}

impl ExitSignal {
    /// Waits until the exit signal has been triggered.
    ///
    /// Returns immediately if it already has been. Cancel-safe.
    pub async fn wait(&mut self) {
        // A dropped coordinator can never trigger, which is treated the same as triggering.
        let _ = self.exit_rx.wait_for(|triggered| *triggered).await;
    }

    /// Returns `true` if the exit signal has been triggered.
    pub fn is_triggered(&self) -> bool {
        *self.exit_rx.borrow()
    }
}

/// Registration of a participant in the shutdown drain.
///
/// Dropping the guard marks the participant as drained.
pub struct DrainGuard {
    key: usize,
    state: Arc<State>,
    signal: ExitSignal,
}

impl DrainGuard {
    /// Returns a handle to the exit signal.
    pub fn signal(&self) -> ExitSignal {
        self.signal.clone()
    }
}

impl fmt::Debug for DrainGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainGuard").field("key", &self.key).finish()
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let mut participants = self.state.participants.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(name) = participants.try_remove(self.key) {
            debug!(participant = %name, "Drain participant finished.");
        }
        drop(participants);
        self.state.drained.notify_waiters();
    }
}
