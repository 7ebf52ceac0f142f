//! Leader election and the pause/resume contract for election-aware collectors.
//!
//! A [`LeaderElector`] decides whether this instance currently leads. The [`ElectionCoordinator`] polls it, publishes
//! the resulting [`ElectionState`], and drives every registered [`ElectionAware`] collector through pause and resume
//! as leadership changes.

use std::time::Duration;

use async_trait::async_trait;
use kestrel_error::GenericError;
use serde::Serialize;
use snafu::Snafu;
use tokio::{select, sync::watch, time::sleep};
use tracing::{debug, info, warn};

mod signal;
pub use self::signal::{
    pause_channel, pause_channel_with_timeouts, ElectionAware, PauseController, PauseListener, PauseSignal,
    PAUSE_SIGNAL_CAPACITY, PAUSE_TIMEOUT, RESUME_TIMEOUT,
};
use crate::runtime::ExitSignal;

/// Election handshake error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ElectionError {
    /// The collector did not accept a pause request in time.
    #[snafu(display("Collector did not accept pause request within {:?}.", timeout))]
    PauseTimeout {
        /// The handshake timeout.
        timeout: Duration,
    },

    /// The collector did not accept a resume request in time.
    #[snafu(display("Collector did not accept resume request within {:?}.", timeout))]
    ResumeTimeout {
        /// The handshake timeout.
        timeout: Duration,
    },

    /// The collector is no longer running.
    #[snafu(display("Collector is no longer running."))]
    CollectorStopped,
}

/// Phase of the local instance in the election state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionPhase {
    /// Another instance leads, or no leader has been established yet.
    Follower,

    /// Leadership changed and collectors are being paused or resumed.
    Transitioning,

    /// This instance leads.
    Leader,
}

/// Leadership state of the local instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ElectionState {
    /// Whether this instance is the leader.
    pub is_leader: bool,

    /// Incremented on every leadership change.
    pub epoch: u64,

    /// Current phase.
    pub phase: ElectionPhase,
}

impl ElectionState {
    /// Initial state: follower at epoch zero.
    pub const fn follower() -> Self {
        Self {
            is_leader: false,
            epoch: 0,
            phase: ElectionPhase::Follower,
        }
    }

    /// State of an instance that always leads, used when election is disabled.
    pub const fn always_leader() -> Self {
        Self {
            is_leader: true,
            epoch: 0,
            phase: ElectionPhase::Leader,
        }
    }
}

/// Result of one election round.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Campaign {
    /// Whether this instance leads after the round.
    pub is_leader: bool,

    /// How long to wait before the next round.
    pub next_round_in: Duration,
}

/// A source of leadership decisions.
#[async_trait]
pub trait LeaderElector: Send {
    /// Runs one election round.
    ///
    /// `currently_leader` tells the elector whether to campaign for leadership or renew it.
    async fn campaign(&mut self, currently_leader: bool) -> Result<Campaign, GenericError>;
}

/// An elector with a fixed outcome.
#[derive(Clone, Debug)]
pub struct StaticElector {
    is_leader: bool,
    interval: Duration,
}

impl StaticElector {
    /// Creates an elector that always returns `is_leader`, re-checked every `interval`.
    pub fn new(is_leader: bool, interval: Duration) -> Self {
        Self { is_leader, interval }
    }
}

#[async_trait]
impl LeaderElector for StaticElector {
    async fn campaign(&mut self, _currently_leader: bool) -> Result<Campaign, GenericError> {
        Ok(Campaign {
            is_leader: self.is_leader,
            next_round_in: self.interval,
        })
    }
}

struct Participant {
    name: String,
    target: Box<dyn ElectionAware>,
    paused: bool,
}

/// Drives leader election and gates election-aware collectors on the outcome.
pub struct ElectionCoordinator {
    elector: Box<dyn LeaderElector>,
    state_tx: watch::Sender<ElectionState>,
    participants: Vec<Participant>,
    retry_interval: Duration,
}

impl ElectionCoordinator {
    /// Creates a coordinator starting as a follower.
    pub fn new<E>(elector: E) -> Self
    where
        E: LeaderElector + 'static,
    {
        let (state_tx, _) = watch::channel(ElectionState::follower());
        Self {
            elector: Box::new(elector),
            state_tx,
            participants: Vec::new(),
            retry_interval: Duration::from_secs(5),
        }
    }

    /// Sets how long to wait before the next round when the elector fails.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Subscribes to leadership state changes.
    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.state_tx.subscribe()
    }

    /// Registers an election-aware collector.
    ///
    /// `paused` must reflect whether the collector starts out paused.
    pub fn register<S, T>(&mut self, name: S, target: T, paused: bool)
    where
        S: Into<String>,
        T: ElectionAware + 'static,
    {
        self.participants.push(Participant {
            name: name.into(),
            target: Box::new(target),
            paused,
        });
    }

    /// Returns the current state.
    pub fn state(&self) -> ElectionState {
        *self.state_tx.borrow()
    }

    /// Runs election rounds until the exit signal fires.
    pub async fn run(mut self, mut exit: ExitSignal) {
        info!(participants = self.participants.len(), "Election coordinator started.");

        loop {
            let currently_leader = self.state().is_leader;
            let round = select! {
                biased;
                _ = exit.wait() => break,
                round = self.elector.campaign(currently_leader) => round,
            };

            let next_round_in = match round {
                Ok(campaign) => {
                    self.apply(campaign.is_leader).await;
                    campaign.next_round_in
                }
                Err(e) => {
                    warn!(error = %e, "Election round failed. Treating this instance as a follower.");
                    self.apply(false).await;
                    self.retry_interval
                }
            };

            select! {
                biased;
                _ = exit.wait() => break,
                _ = sleep(next_round_in) => {}
            }
        }

        debug!("Election coordinator stopped.");
    }

    /// Applies a leadership decision and reconciles participants with it.
    pub async fn apply(&mut self, is_leader: bool) {
        let current = self.state();
        if current.is_leader != is_leader {
            let epoch = current.epoch + 1;
            info!(is_leader, epoch, "Leadership changed.");
            self.state_tx.send_replace(ElectionState {
                is_leader,
                epoch,
                phase: ElectionPhase::Transitioning,
            });
        }

        self.reconcile(is_leader).await;

        let phase = if is_leader {
            ElectionPhase::Leader
        } else {
            ElectionPhase::Follower
        };
        self.state_tx.send_if_modified(|state| {
            let changed = state.phase != phase;
            state.phase = phase;
            changed
        });
    }

    async fn reconcile(&mut self, is_leader: bool) {
        let should_pause = !is_leader;
        for participant in self.participants.iter_mut().filter(|p| p.paused != should_pause) {
            let result = if should_pause {
                participant.target.pause().await
            } else {
                participant.target.resume().await
            };

            match result {
                Ok(()) => {
                    participant.paused = should_pause;
                    debug!(collector = %participant.name, paused = should_pause, "Collector acknowledged election transition.");
                }
                Err(e) => {
                    // The participant keeps its previous state and is retried on the next round.
                    warn!(collector = %participant.name, error = %e, "Collector failed election transition.");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc,
    };

    use tokio::time::timeout;

    use super::*;
    use crate::runtime::ExitCoordinator;

    #[derive(Clone, Default)]
    struct Recorder {
        pauses: Arc<AtomicUsize>,
        resumes: Arc<AtomicUsize>,
        fail_next: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ElectionAware for Recorder {
        async fn pause(&self) -> Result<(), ElectionError> {
            if self.fail_next.swap(false, SeqCst) {
                return Err(ElectionError::PauseTimeout {
                    timeout: PAUSE_TIMEOUT,
                });
            }
            self.pauses.fetch_add(1, SeqCst);
            Ok(())
        }

        async fn resume(&self) -> Result<(), ElectionError> {
            if self.fail_next.swap(false, SeqCst) {
                return Err(ElectionError::ResumeTimeout {
                    timeout: RESUME_TIMEOUT,
                });
            }
            self.resumes.fetch_add(1, SeqCst);
            Ok(())
        }
    }

    struct ScriptedElector {
        outcomes: Vec<bool>,
    }

    #[async_trait]
    impl LeaderElector for ScriptedElector {
        async fn campaign(&mut self, _currently_leader: bool) -> Result<Campaign, GenericError> {
            let is_leader = if self.outcomes.is_empty() {
                false
            } else {
                self.outcomes.remove(0)
            };
            Ok(Campaign {
                is_leader,
                next_round_in: Duration::from_millis(10),
            })
        }
    }

    #[tokio::test]
    async fn transitions_bump_epoch_and_drive_participants() {
        let recorder = Recorder::default();
        let mut coordinator = ElectionCoordinator::new(StaticElector::new(true, Duration::from_secs(1)));
        coordinator.register("cpu", recorder.clone(), true);

        coordinator.apply(true).await;
        assert_eq!(
            coordinator.state(),
            ElectionState {
                is_leader: true,
                epoch: 1,
                phase: ElectionPhase::Leader
            }
        );
        assert_eq!(recorder.resumes.load(SeqCst), 1);

        // Re-applying the same decision is a no-op.
        coordinator.apply(true).await;
        assert_eq!(coordinator.state().epoch, 1);
        assert_eq!(recorder.resumes.load(SeqCst), 1);

        coordinator.apply(false).await;
        assert_eq!(coordinator.state().epoch, 2);
        assert_eq!(coordinator.state().phase, ElectionPhase::Follower);
        assert_eq!(recorder.pauses.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_handshake_keeps_prior_state_and_is_retried() {
        let recorder = Recorder::default();
        let mut coordinator = ElectionCoordinator::new(StaticElector::new(true, Duration::from_secs(1)));
        coordinator.register("cpu", recorder.clone(), true);

        recorder.fail_next.store(true, SeqCst);
        coordinator.apply(true).await;
        assert_eq!(recorder.resumes.load(SeqCst), 0);
        assert!(coordinator.participants[0].paused);

        // The next round retries the pending transition without another epoch bump.
        coordinator.apply(true).await;
        assert_eq!(recorder.resumes.load(SeqCst), 1);
        assert!(!coordinator.participants[0].paused);
        assert_eq!(coordinator.state().epoch, 1);
    }

    #[tokio::test]
    async fn run_follows_elector_until_exit() {
        let recorder = Recorder::default();
        let mut coordinator = ElectionCoordinator::new(ScriptedElector {
            outcomes: vec![true, true, false],
        });
        coordinator.register("cpu", recorder.clone(), true);
        let mut states = coordinator.subscribe();

        let exit = ExitCoordinator::new();
        let handle = tokio::spawn(coordinator.run(exit.signal()));

        timeout(Duration::from_secs(2), states.wait_for(|s| s.epoch == 2 && s.phase == ElectionPhase::Follower))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorder.resumes.load(SeqCst), 1);
        assert_eq!(recorder.pauses.load(SeqCst), 1);

        exit.trigger();
        timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
