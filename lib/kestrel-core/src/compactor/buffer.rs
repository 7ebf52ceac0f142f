use std::sync::Arc;

use tokio::time::{Duration, Instant};

use crate::{
    feeder::FeedBatch,
    point::Category,
    pooling::{PointBuffer, PointPool},
};

/// Why a category buffer was flushed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushReason {
    /// The pending count reached the configured maximum.
    Count,

    /// The flush interval elapsed.
    Interval,

    /// The pipeline is shutting down.
    Shutdown,
}

impl FlushReason {
    pub(crate) const fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Count => "count",
            FlushReason::Interval => "interval",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

/// Points taken out of a category buffer, ready to be filtered and encoded.
pub(crate) struct PendingFlush {
    pub category: Category,
    pub points: PointBuffer,
    pub sources: Arc<[Arc<str>]>,
    pub reason: FlushReason,
}

/// Pending points for one category.
///
/// Holds at most `max_pending` points; reaching the limit produces a flush immediately. Each buffer tracks its own
/// last-flush instant, so busy categories flushing on count never delay interval flushes of quiet ones.
pub(crate) struct CategoryBuffer {
    category: Category,
    pool: PointPool,
    pending: PointBuffer,
    sources: Vec<Arc<str>>,
    max_pending: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl CategoryBuffer {
    pub fn new(category: Category, pool: PointPool, max_pending: usize, flush_interval: Duration) -> Self {
        let max_pending = max_pending.max(1);
        Self {
            category,
            pending: pool.acquire(max_pending),
            pool,
            sources: Vec::new(),
            max_pending,
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    /// Returns when the buffer is next due for an interval flush, if it holds any points.
    pub fn deadline(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.last_flush + self.flush_interval)
        }
    }

    /// Appends a fed batch, returning a flush for every time the pending count reached its maximum.
    pub fn push(&mut self, mut batch: FeedBatch) -> Vec<PendingFlush> {
        let mut flushes = Vec::new();
        for point in batch.points.drain(..) {
            self.note_source(&batch.source);
            self.pending.push(point);

            if self.pending.len() >= self.max_pending {
                flushes.push(self.take(FlushReason::Count));
            }
        }
        flushes
    }

    /// Takes every pending point, if there are any.
    pub fn flush(&mut self, reason: FlushReason) -> Option<PendingFlush> {
        if self.pending.is_empty() {
            self.last_flush = Instant::now();
            return None;
        }
        Some(self.take(reason))
    }

    fn note_source(&mut self, source: &Arc<str>) {
        if !self.sources.iter().any(|known| known == source) {
            self.sources.push(Arc::clone(source));
        }
    }

    fn take(&mut self, reason: FlushReason) -> PendingFlush {
        let points = std::mem::replace(&mut self.pending, self.pool.acquire(self.max_pending));
        let sources = std::mem::take(&mut self.sources);
        self.last_flush = Instant::now();

        PendingFlush {
            category: self.category,
            points,
            sources: sources.into(),
            reason,
        }
    }
}
