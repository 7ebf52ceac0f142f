use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

use super::ElectionError;

/// Capacity of each collector's pause/resume signal queue.
pub const PAUSE_SIGNAL_CAPACITY: usize = 8;

/// How long a pause request may wait for queue space before failing.
pub const PAUSE_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a resume request may wait for queue space before failing.
pub const RESUME_TIMEOUT: Duration = Duration::from_secs(15);

/// A leadership-driven instruction for an election-aware collector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PauseSignal {
    /// Stop producing points.
    Pause,

    /// Start producing points again.
    Resume,
}

/// The pause/resume contract implemented by election-aware collectors.
#[async_trait]
pub trait ElectionAware: Send + Sync {
    /// Asks the collector to stop producing points.
    async fn pause(&self) -> Result<(), ElectionError>;

    /// Asks the collector to resume producing points.
    async fn resume(&self) -> Result<(), ElectionError>;
}

/// Creates a bounded pause/resume signal queue.
pub fn pause_channel() -> (PauseController, PauseListener) {
    pause_channel_with_timeouts(PAUSE_TIMEOUT, RESUME_TIMEOUT)
}

/// Creates a bounded pause/resume signal queue with custom handshake timeouts.
pub fn pause_channel_with_timeouts(
    pause_timeout: Duration, resume_timeout: Duration,
) -> (PauseController, PauseListener) {
    let (signal_tx, signal_rx) = mpsc::channel(PAUSE_SIGNAL_CAPACITY);
    (
        PauseController {
            signal_tx,
            pause_timeout,
            resume_timeout,
        },
        PauseListener { signal_rx },
    )
}

/// Sending half of a collector's signal queue, held by the election coordinator.
#[derive(Clone, Debug)]
pub struct PauseController {
    signal_tx: mpsc::Sender<PauseSignal>,
    pause_timeout: Duration,
    resume_timeout: Duration,
}

impl PauseController {
    async fn send(&self, signal: PauseSignal) -> Result<(), ElectionError> {
        let timeout = match signal {
            PauseSignal::Pause => self.pause_timeout,
            PauseSignal::Resume => self.resume_timeout,
        };

        match self.signal_tx.send_timeout(signal, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(match signal {
                PauseSignal::Pause => ElectionError::PauseTimeout { timeout },
                PauseSignal::Resume => ElectionError::ResumeTimeout { timeout },
            }),
            Err(SendTimeoutError::Closed(_)) => Err(ElectionError::CollectorStopped),
        }
    }
}

#[async_trait]
impl ElectionAware for PauseController {
    async fn pause(&self) -> Result<(), ElectionError> {
        self.send(PauseSignal::Pause).await
    }

    async fn resume(&self) -> Result<(), ElectionError> {
        self.send(PauseSignal::Resume).await
    }
}

/// Receiving half of a collector's signal queue, polled by the collector's main loop.
#[derive(Debug)]
pub struct PauseListener {
    signal_rx: mpsc::Receiver<PauseSignal>,
}

impl PauseListener {
    /// Waits for the next signal. Returns `None` once the controller is gone.
    pub async fn recv(&mut self) -> Option<PauseSignal> {
        self.signal_rx.recv().await
    }
}
