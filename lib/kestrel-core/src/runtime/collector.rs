use std::{collections::HashSet, future::pending, time::Duration};

use async_trait::async_trait;
use kestrel_error::GenericError;
use snafu::Snafu;
use tokio::{
    select,
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::{DrainGuard, ExitCoordinator};
use crate::{
    election::{pause_channel, ElectionCoordinator, PauseListener, PauseSignal},
    feeder::{FeedError, FeedOption, Feeder},
    point::Category,
    pooling::{PointBuffer, PointPool},
};

/// Collector registration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RegistryError {
    /// A collector with the same name is already registered.
    #[snafu(display("Collector '{}' is already registered.", name))]
    DuplicateCollector {
        /// The duplicated name.
        name: String,
    },
}

/// A periodic producer of points.
#[async_trait]
pub trait Collector: Send {
    /// Unique name, used as the source of every batch the collector feeds.
    fn name(&self) -> &str;

    /// Category of the collected points.
    fn category(&self) -> Category;

    /// Time between collections.
    fn interval(&self) -> Duration;

    /// Whether the collector only runs on the election leader.
    fn election_aware(&self) -> bool {
        false
    }

    /// Collects one batch of points into a buffer acquired from `pool`.
    ///
    /// An empty buffer means there was nothing to report this round.
    async fn collect(&mut self, pool: &PointPool) -> Result<PointBuffer, GenericError>;
}

/// The set of collectors the agent runs, built once at startup.
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: Vec<Box<dyn Collector>>,
    names: HashSet<String>,
}

impl CollectorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a collector.
    ///
    /// # Errors
    ///
    /// If a collector with the same name is already registered, an error is returned.
    pub fn register<C>(&mut self, collector: C) -> Result<(), RegistryError>
    where
        C: Collector + 'static,
    {
        let name = collector.name().to_string();
        if !self.names.insert(name.clone()) {
            return Err(RegistryError::DuplicateCollector { name });
        }

        self.collectors.push(Box::new(collector));
        Ok(())
    }

    /// Returns the number of registered collectors.
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// Returns `true` if no collectors are registered.
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Spawns one task per collector.
    ///
    /// Election-aware collectors start paused and are registered with `election`, which resumes them once this
    /// instance leads. Every task registers with `exit` and stops at the next suspension point after the exit signal.
    pub fn spawn(
        self, feeder: &Feeder, pool: &PointPool, exit: &ExitCoordinator, election: &mut ElectionCoordinator,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.collectors.len());
        for collector in self.collectors {
            let name = collector.name().to_string();
            let guard = exit.register(format!("collector/{}", name));

            let listener = if collector.election_aware() {
                let (controller, listener) = pause_channel();
                election.register(name.clone(), controller, true);
                Some(listener)
            } else {
                None
            };

            debug!(collector = %name, election_aware = listener.is_some(), "Spawning collector.");
            handles.push(tokio::spawn(run_collector(
                collector,
                feeder.clone(),
                pool.clone(),
                guard,
                listener,
            )));
        }

        info!(collectors = handles.len(), "Collectors started.");
        handles
    }
}

async fn next_signal(listener: &mut Option<PauseListener>) -> Option<PauseSignal> {
    match listener {
        Some(listener) => listener.recv().await,
        None => pending().await,
    }
}

/// Runs a collector until the exit signal fires.
///
/// The loop waits on the exit signal, then pause/resume signals, then the collection timer, in that priority order.
/// A collector with a pause listener starts paused.
async fn run_collector(
    mut collector: Box<dyn Collector>, feeder: Feeder, pool: PointPool, guard: DrainGuard,
    mut listener: Option<PauseListener>,
) {
    let mut exit = guard.signal();
    let name = collector.name().to_string();
    let category = collector.category();
    let election_scope = collector.election_aware();
    let mut paused = listener.is_some();

    let mut ticker = interval(collector.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        select! {
            biased;

            _ = exit.wait() => break,

            signal = next_signal(&mut listener) => match signal {
                Some(PauseSignal::Pause) => {
                    debug!(collector = %name, "Collector paused.");
                    paused = true;
                }
                Some(PauseSignal::Resume) => {
                    debug!(collector = %name, "Collector resumed.");
                    paused = false;
                }
                None => listener = None,
            },

            _ = ticker.tick() => {
                if paused {
                    continue;
                }

                let start = Instant::now();
                let collected = select! {
                    biased;
                    _ = exit.wait() => break,
                    result = collector.collect(&pool) => result,
                };

                let opts = FeedOption::new(name.as_str())
                    .with_cost(start.elapsed())
                    .with_election_scope(election_scope);

                match collected {
                    Ok(points) if points.is_empty() => {}
                    Ok(points) => match feeder.feed_v2(category, points, &opts).await {
                        Ok(()) => {}
                        Err(FeedError::Stopping { .. }) => break,
                        Err(e) => {
                            warn!(collector = %name, error = %e, "Collector produced a batch the feeder rejected.");
                            feeder.feed_last_error(category, e.to_string(), &opts);
                        }
                    },
                    Err(e) => {
                        warn!(collector = %name, error = %e, "Collection failed.");
                        feeder.feed_last_error(category, format!("{:#}", e), &opts);
                    }
                }
            }
        }
    }

    debug!(collector = %name, "Collector stopped.");
    drop(guard);
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    };

    use kestrel_error::generic_error;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::{
        election::{ElectionAware, StaticElector},
        point::Point,
    };

    struct Ticker {
        name: &'static str,
        election_aware: bool,
        fail: bool,
        collections: Arc<AtomicUsize>,
    }

    impl Ticker {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                election_aware: false,
                fail: false,
                collections: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Collector for Ticker {
        fn name(&self) -> &str {
            self.name
        }

        fn category(&self) -> Category {
            Category::Metric
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn election_aware(&self) -> bool {
            self.election_aware
        }

        async fn collect(&mut self, pool: &PointPool) -> Result<PointBuffer, GenericError> {
            let seq = self.collections.fetch_add(1, SeqCst);
            if self.fail {
                return Err(generic_error!("scrape failed"));
            }

            let mut points = pool.acquire(1);
            points.push(
                Point::builder(self.name, Category::Metric)
                    .field("seq", seq as i64)
                    .build()?,
            );
            Ok(points)
        }
    }

    fn feed_count(feeder: &Feeder, source: &str) -> u64 {
        feeder
            .input_stats()
            .into_iter()
            .find(|s| s.source == source)
            .map_or(0, |s| s.feed_count)
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = CollectorRegistry::new();
        registry.register(Ticker::new("cpu")).unwrap();
        assert!(matches!(
            registry.register(Ticker::new("cpu")),
            Err(RegistryError::DuplicateCollector { name }) if name == "cpu"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn collectors_feed_on_each_tick_and_drain_on_exit() {
        let exit = ExitCoordinator::new();
        let (feeder, _receivers) = Feeder::builder().build(exit.signal());
        let pool = PointPool::new(4);
        let mut election = ElectionCoordinator::new(StaticElector::new(true, Duration::from_secs(1)));

        let mut registry = CollectorRegistry::new();
        registry.register(Ticker::new("cpu")).unwrap();
        registry.spawn(&feeder, &pool, &exit, &mut election);

        sleep(Duration::from_millis(3_500)).await;
        assert_eq!(feed_count(&feeder, "cpu"), 4);

        exit.trigger();
        exit.wait_for_drain(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn collection_failures_become_last_errors() {
        let exit = ExitCoordinator::new();
        let (feeder, _receivers) = Feeder::builder().build(exit.signal());
        let pool = PointPool::new(4);
        let mut election = ElectionCoordinator::new(StaticElector::new(true, Duration::from_secs(1)));

        let mut collector = Ticker::new("redis");
        collector.fail = true;
        let mut registry = CollectorRegistry::new();
        registry.register(collector).unwrap();
        registry.spawn(&feeder, &pool, &exit, &mut election);

        sleep(Duration::from_millis(1_500)).await;
        let record = feeder.last_errors().get("redis", Category::Metric).unwrap();
        assert_eq!(record.message, "scrape failed");
        assert_eq!(feed_count(&feeder, "redis"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_collector_never_feeds_until_resumed() {
        let exit = ExitCoordinator::new();
        let (feeder, _receivers) = Feeder::builder().build(exit.signal());
        let pool = PointPool::new(4);
        let mut election = ElectionCoordinator::new(StaticElector::new(false, Duration::from_secs(1)));

        let mut collector = Ticker::new("mysql");
        collector.election_aware = true;
        let collections = Arc::clone(&collector.collections);
        let mut registry = CollectorRegistry::new();
        registry.register(collector).unwrap();
        registry.spawn(&feeder, &pool, &exit, &mut election);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(collections.load(SeqCst), 0);
        assert_eq!(feed_count(&feeder, "mysql"), 0);

        election.apply(true).await;
        sleep(Duration::from_millis(2_500)).await;
        assert!(feed_count(&feeder, "mysql") >= 2);

        election.apply(false).await;
        sleep(Duration::from_millis(10)).await;
        let paused_at = collections.load(SeqCst);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(collections.load(SeqCst), paused_at);

        exit.trigger();
        exit.wait_for_drain(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn signal_burst_is_processed_in_order() {
        let exit = ExitCoordinator::new();
        let (feeder, _receivers) = Feeder::builder().build(exit.signal());
        let pool = PointPool::new(4);
        let (controller, listener) = pause_channel();

        let mut collector = Ticker::new("postgres");
        collector.election_aware = true;
        let collections = Arc::clone(&collector.collections);
        let handle = tokio::spawn(run_collector(
            Box::new(collector),
            feeder.clone(),
            pool,
            exit.register("collector/postgres"),
            Some(listener),
        ));

        // Resume, pause, resume, pause: the collector must end up paused without blocking the sender.
        for _ in 0..2 {
            timeout(Duration::from_secs(1), controller.resume()).await.unwrap().unwrap();
            timeout(Duration::from_secs(1), controller.pause()).await.unwrap().unwrap();
        }

        sleep(Duration::from_secs(5)).await;
        assert_eq!(collections.load(SeqCst), 0);

        timeout(Duration::from_secs(1), controller.resume()).await.unwrap().unwrap();
        sleep(Duration::from_millis(1_500)).await;
        assert!(collections.load(SeqCst) >= 1);

        exit.trigger();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
