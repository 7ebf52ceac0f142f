//! Per-category buffering, filtering, and encoding of fed points into upload transactions.
//!
//! The compactor consumes the per-category queues produced by the [`Feeder`][crate::feeder::Feeder]. Categories are
//! spread over a small number of workers. Each worker keeps one [`CategoryBuffer`][buffer::CategoryBuffer] per
//! category it owns and flushes it when the pending count reaches the configured maximum or the flush interval elapses,
//! whichever comes first. Flushed points go through the [`FilterEngine`], are encoded into bodies no larger than the
//! maximum raw body size, and leave as [`Transaction`]s.

use std::{
    future::pending,
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc,
    },
    time::Duration,
};

use futures::{
    stream::{self, BoxStream, SelectAll},
    FutureExt as _, StreamExt as _,
};
use metrics::counter;
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

mod buffer;
pub use self::buffer::FlushReason;
use self::buffer::{CategoryBuffer, PendingFlush};

mod request;
pub use self::request::{EncodedBody, RequestError};
use self::request::RequestBuilder;

use crate::{
    feeder::{FeedBatch, FeedReceivers, LastErrors},
    filter::FilterEngine,
    point::Category,
    pooling::{PointBuffer, PointPool},
    runtime::{ExitCoordinator, ExitSignal},
};

/// Default pending-count flush threshold.
pub const DEFAULT_MAX_CACHE_COUNT: usize = 1000;

/// Default time-based flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Default maximum raw body size, in bytes.
pub const DEFAULT_MAX_RAW_BODY_SIZE: usize = 10_000_000;

/// Default size at which bodies are gzip-compressed, in bytes.
pub const DEFAULT_GZIP_MIN_SIZE: usize = 1024;

/// Compactor settings.
#[derive(Clone, Debug)]
pub struct CompactorConfig {
    /// Pending points per category that force an immediate flush.
    pub max_cache_count: usize,

    /// Time after the last flush at which a non-empty category is flushed.
    pub flush_interval: Duration,

    /// Number of workers the categories are spread over.
    pub workers: usize,

    /// Maximum size of an encoded body before compression.
    pub max_raw_body_size: usize,

    /// Bodies at least this large are gzip-compressed.
    pub gzip_min_size: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            max_cache_count: DEFAULT_MAX_CACHE_COUNT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            workers: 1,
            max_raw_body_size: DEFAULT_MAX_RAW_BODY_SIZE,
            gzip_min_size: DEFAULT_GZIP_MIN_SIZE,
        }
    }
}

/// An encoded body ready for upload, along with the points it was encoded from.
///
/// Every body produced by one flush shares the same point buffer, which returns to the pool once the last clone of
/// the last transaction is dropped.
#[derive(Clone, Debug)]
pub struct Transaction {
    /// Category of every point in the body.
    pub category: Category,

    /// The encoded body.
    pub body: EncodedBody,

    /// The points of the flush this body belongs to.
    pub points: Arc<PointBuffer>,

    /// Sources that contributed points to the flush.
    pub sources: Arc<[Arc<str>]>,
}

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    points_flushed: AtomicU64,
    points_dropped: AtomicU64,
    bodies: AtomicU64,
}

/// Cumulative compactor activity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CompactorStats {
    /// Non-empty flushes performed.
    pub flushes: u64,

    /// Points handed to encoding after filtering.
    pub points_flushed: u64,

    /// Points removed by filter rules.
    pub points_dropped: u64,

    /// Bodies produced.
    pub bodies: u64,
}

/// Shared handle to compactor activity counters.
#[derive(Clone, Debug, Default)]
pub struct CompactorStatsHandle {
    counters: Arc<Counters>,
}

impl CompactorStatsHandle {
    /// Returns a snapshot of the counters.
    pub fn snapshot(&self) -> CompactorStats {
        CompactorStats {
            flushes: self.counters.flushes.load(Relaxed),
            points_flushed: self.counters.points_flushed.load(Relaxed),
            points_dropped: self.counters.points_dropped.load(Relaxed),
            bodies: self.counters.bodies.load(Relaxed),
        }
    }
}

/// Turns fed batches into upload transactions.
pub struct Compactor {
    config: CompactorConfig,
    pool: PointPool,
    filter: Arc<FilterEngine>,
    last_errors: LastErrors,
    transactions: mpsc::Sender<Transaction>,
    stats: CompactorStatsHandle,
}

impl Compactor {
    /// Creates a compactor sending its output to `transactions`.
    pub fn new(
        config: CompactorConfig, pool: PointPool, filter: Arc<FilterEngine>, last_errors: LastErrors,
        transactions: mpsc::Sender<Transaction>,
    ) -> Self {
        Self {
            config,
            pool,
            filter,
            last_errors,
            transactions,
            stats: CompactorStatsHandle::default(),
        }
    }

    /// Returns a handle to the activity counters.
    pub fn stats(&self) -> CompactorStatsHandle {
        self.stats.clone()
    }

    /// Spawns the workers.
    ///
    /// Each worker registers with `exit` and, once the exit signal fires, drains whatever is still queued, flushes
    /// every buffer, and then marks itself drained.
    pub fn spawn(self, receivers: FeedReceivers, exit: &ExitCoordinator) -> Vec<JoinHandle<()>> {
        let worker_count = self.config.workers.max(1);
        let mut assignments: Vec<Vec<(Category, mpsc::Receiver<FeedBatch>)>> =
            (0..worker_count).map(|_| Vec::new()).collect();
        for (i, receiver) in receivers.into_inner().into_iter().enumerate() {
            assignments[i % worker_count].push(receiver);
        }

        let mut handles = Vec::new();
        for (worker_id, assigned) in assignments.into_iter().enumerate() {
            if assigned.is_empty() {
                continue;
            }

            let guard = exit.register(format!("compactor/{}", worker_id));
            let worker = Worker::new(worker_id, &self, assigned);
            handles.push(tokio::spawn(async move {
                let signal = guard.signal();
                worker.run(signal).await;
                drop(guard);
            }));
        }

        info!(workers = handles.len(), "Compactor started.");
        handles
    }
}

struct Worker {
    id: usize,
    buffers: Vec<CategoryBuffer>,
    batches: SelectAll<BoxStream<'static, (usize, FeedBatch)>>,
    builder: RequestBuilder,
    filter: Arc<FilterEngine>,
    last_errors: LastErrors,
    transactions: mpsc::Sender<Transaction>,
    stats: CompactorStatsHandle,
}

impl Worker {
    fn new(id: usize, compactor: &Compactor, assigned: Vec<(Category, mpsc::Receiver<FeedBatch>)>) -> Self {
        let config = &compactor.config;
        let mut buffers = Vec::with_capacity(assigned.len());
        let mut batches = SelectAll::new();
        for (index, (category, mut rx)) in assigned.into_iter().enumerate() {
            buffers.push(CategoryBuffer::new(
                category,
                compactor.pool.clone(),
                config.max_cache_count,
                config.flush_interval,
            ));
            batches.push(
                stream::poll_fn(move |cx| rx.poll_recv(cx))
                    .map(move |batch| (index, batch))
                    .boxed(),
            );
        }

        Self {
            id,
            buffers,
            batches,
            builder: RequestBuilder::new(config.max_raw_body_size, config.gzip_min_size),
            filter: Arc::clone(&compactor.filter),
            last_errors: compactor.last_errors.clone(),
            transactions: compactor.transactions.clone(),
            stats: compactor.stats.clone(),
        }
    }

    async fn run(mut self, mut exit: ExitSignal) {
        let categories: Vec<_> = self.buffers.iter().map(|b| b.category().as_str()).collect();
        debug!(worker = self.id, ?categories, "Compactor worker started.");

        loop {
            let deadline = self.next_deadline();
            let flush_timer = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending().await,
                }
            };

            select! {
                biased;
                _ = exit.wait() => break,
                maybe_batch = self.batches.next() => match maybe_batch {
                    Some((index, batch)) => self.accept(index, batch).await,
                    None => {
                        debug!(worker = self.id, "All feed queues closed.");
                        break;
                    }
                },
                _ = flush_timer => self.flush_due().await,
            }
        }

        // Batches already accepted by the feeder are still delivered.
        while let Some(Some((index, batch))) = self.batches.next().now_or_never() {
            self.accept(index, batch).await;
        }
        for index in 0..self.buffers.len() {
            if let Some(flush) = self.buffers[index].flush(FlushReason::Shutdown) {
                self.flush(flush).await;
            }
        }

        debug!(worker = self.id, "Compactor worker stopped.");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.buffers.iter().filter_map(CategoryBuffer::deadline).min()
    }

    async fn accept(&mut self, index: usize, batch: FeedBatch) {
        for flush in self.buffers[index].push(batch) {
            self.flush(flush).await;
        }
    }

    async fn flush_due(&mut self) {
        let now = Instant::now();
        for index in 0..self.buffers.len() {
            let due = self.buffers[index].deadline().is_some_and(|deadline| deadline <= now);
            if !due {
                continue;
            }
            if let Some(flush) = self.buffers[index].flush(FlushReason::Interval) {
                self.flush(flush).await;
            }
        }
    }

    async fn flush(&mut self, flush: PendingFlush) {
        let PendingFlush {
            category,
            mut points,
            sources,
            reason,
        } = flush;

        counter!("compactor_flushes_total", "category" => category.as_str(), "reason" => reason.as_str()).increment(1);
        self.stats.counters.flushes.fetch_add(1, Relaxed);

        let dropped = self.filter.apply(&mut points);
        if dropped > 0 {
            counter!("filter_points_dropped_total", "category" => category.as_str()).increment(dropped as u64);
            self.stats.counters.points_dropped.fetch_add(dropped as u64, Relaxed);
        }
        if points.is_empty() {
            return;
        }

        debug!(worker = self.id, %category, points = points.len(), reason = reason.as_str(), "Flushing category buffer.");
        self.stats.counters.points_flushed.fetch_add(points.len() as u64, Relaxed);

        let requests = match self.builder.build(&points).await {
            Ok(requests) => requests,
            Err(e) => {
                error!(%category, error = %e, "Failed to encode flushed points. Dropping flush.");
                self.record_for_sources(&sources, category, format!("failed to encode points: {}", e));
                return;
            }
        };

        for rejected in requests.rejected {
            warn!(%category, error = %rejected, "Dropping point that cannot fit in any request body.");
            self.record_for_sources(&sources, category, rejected.to_string());
        }

        let points = Arc::new(points);
        for body in requests.bodies {
            self.stats.counters.bodies.fetch_add(1, Relaxed);
            let transaction = Transaction {
                category,
                body,
                points: Arc::clone(&points),
                sources: Arc::clone(&sources),
            };
            if self.transactions.send(transaction).await.is_err() {
                warn!(%category, "Upload path is closed. Dropping flushed points.");
                return;
            }
        }
    }

    fn record_for_sources(&self, sources: &[Arc<str>], category: Category, message: String) {
        for source in sources {
            self.last_errors.record(source.as_ref(), category, message.clone());
        }
    }
}
