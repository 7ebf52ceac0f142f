//! Point buffer pooling.
//!
//! Collectors acquire a [`PointBuffer`] from the shared [`PointPool`], fill it, and hand it to the feeder. The buffer
//! travels through the pipeline and is returned to the pool when its last owner drops it, which for uploaded points is
//! only after the upload has finished. Returning is tied to `Drop`, so a buffer cannot be released twice or used after
//! release through safe code.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, Ordering::Relaxed},
        Arc, Mutex, PoisonError,
    },
};

#[cfg(debug_assertions)]
use std::collections::HashSet;

use metrics::{counter, gauge, Counter, Gauge};
use tracing::trace;

use crate::point::Point;

/// Default number of free buffers retained by the pool.
pub const DEFAULT_RESERVED_CAPACITY: usize = 64;

/// Default upper bound on the point capacity a retained buffer may keep.
pub const DEFAULT_MAX_RETAINED_POINTS: usize = 4096;

struct PoolMetrics {
    acquired: Counter,
    released: Counter,
    allocated: Counter,
    in_use: Gauge,
}

impl PoolMetrics {
    fn new() -> Self {
        Self {
            acquired: counter!("point_pool_acquired_total"),
            released: counter!("point_pool_released_total"),
            allocated: counter!("point_pool_allocated_total"),
            in_use: gauge!("point_pool_in_use"),
        }
    }
}

/// Point-in-time view of pool activity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Buffers handed out since the pool was created.
    pub acquired: u64,

    /// Buffers returned since the pool was created.
    pub released: u64,

    /// Buffers that had to be freshly allocated because no free buffer was available.
    pub allocated: u64,

    /// Buffers currently sitting in the free list.
    pub free: usize,
}

impl PoolStats {
    /// Returns the number of buffers currently held outside the pool.
    pub fn in_use(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

struct PoolState {
    free: Mutex<Vec<Vec<Point>>>,
    reserved_capacity: usize,
    max_retained_points: usize,
    next_id: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    allocated: AtomicU64,
    metrics: PoolMetrics,

    #[cfg(debug_assertions)]
    outstanding: Mutex<HashSet<u64>>,
}

impl PoolState {
    fn reclaim(&self, id: u64, mut points: Vec<Point>) {
        #[cfg(debug_assertions)]
        {
            let was_outstanding = self
                .outstanding
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            debug_assert!(was_outstanding, "point buffer {} returned to the pool twice", id);
        }

        points.clear();
        if points.capacity() > self.max_retained_points {
            points.shrink_to(self.max_retained_points);
        }

        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.reserved_capacity {
            free.push(points);
        }
        drop(free);

        self.released.fetch_add(1, Relaxed);
        self.metrics.released.increment(1);
        self.metrics.in_use.decrement(1.0);
        trace!(buffer_id = id, "Reclaimed point buffer.");
    }
}

/// A shared pool of point buffers.
///
/// Acquiring never waits: when no free buffer is available, a new one is allocated. At most `reserved_capacity` free
/// buffers are retained; surplus buffers are freed on release.
#[derive(Clone)]
pub struct PointPool {
    state: Arc<PoolState>,
}

impl PointPool {
    /// Creates a new pool that retains up to `reserved_capacity` free buffers.
    pub fn new(reserved_capacity: usize) -> Self {
        Self::with_limits(reserved_capacity, DEFAULT_MAX_RETAINED_POINTS)
    }

    /// Creates a new pool with explicit limits on retained buffers and retained per-buffer capacity.
    pub fn with_limits(reserved_capacity: usize, max_retained_points: usize) -> Self {
        Self {
            state: Arc::new(PoolState {
                free: Mutex::new(Vec::with_capacity(reserved_capacity)),
                reserved_capacity,
                max_retained_points,
                next_id: AtomicU64::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
                metrics: PoolMetrics::new(),
                #[cfg(debug_assertions)]
                outstanding: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Acquires an empty buffer able to hold at least `capacity_hint` points without reallocating.
    pub fn acquire(&self, capacity_hint: usize) -> PointBuffer {
        let state = &self.state;
        let reused = state.free.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let points = match reused {
            Some(mut points) => {
                points.reserve(capacity_hint);
                points
            }
            None => {
                state.allocated.fetch_add(1, Relaxed);
                state.metrics.allocated.increment(1);
                Vec::with_capacity(capacity_hint)
            }
        };

        let id = state.next_id.fetch_add(1, Relaxed);
        #[cfg(debug_assertions)]
        state
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);

        state.acquired.fetch_add(1, Relaxed);
        state.metrics.acquired.increment(1);
        state.metrics.in_use.increment(1.0);

        PointBuffer {
            id,
            points,
            state: Arc::clone(state),
        }
    }

    /// Returns a snapshot of pool activity.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.state.acquired.load(Relaxed),
            released: self.state.released.load(Relaxed),
            allocated: self.state.allocated.load(Relaxed),
            free: self.state.free.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}

impl fmt::Debug for PointPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointPool")
            .field("reserved_capacity", &self.state.reserved_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A pooled, exclusively owned buffer of points.
///
/// Dereferences to `Vec<Point>`. The buffer is cleared and returned to its pool when dropped.
pub struct PointBuffer {
    id: u64,
    points: Vec<Point>,
    state: Arc<PoolState>,
}

impl PointBuffer {
    /// Returns the pool-assigned identifier of this buffer.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Deref for PointBuffer {
    type Target = Vec<Point>;

    fn deref(&self) -> &Self::Target {
        &self.points
    }
}

impl DerefMut for PointBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.points
    }
}

impl fmt::Debug for PointBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointBuffer")
            .field("id", &self.id)
            .field("len", &self.points.len())
            .finish()
    }
}

impl Drop for PointBuffer {
    fn drop(&mut self) {
        let points = std::mem::take(&mut self.points);
        self.state.reclaim(self.id, points);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::point::Category;

    fn point(marker: i64) -> Point {
        Point::builder("pool_test", Category::Metric)
            .field("marker", marker)
            .timestamp_ns(marker)
            .build()
            .unwrap()
    }

    #[test]
    fn acquire_allocates_when_empty() {
        let pool = PointPool::new(2);
        let a = pool.acquire(8);
        let b = pool.acquire(8);
        assert!(a.capacity() >= 8);
        assert_eq!(pool.stats().allocated, 2);
        assert_eq!(pool.stats().in_use(), 2);
        drop((a, b));

        let stats = pool.stats();
        assert_eq!(stats.in_use(), 0);
        assert_eq!(stats.free, 2);
    }

    #[test]
    fn released_buffers_are_reused_and_cleared() {
        let pool = PointPool::new(4);
        let mut buffer = pool.acquire(4);
        buffer.push(point(1));
        drop(buffer);

        let reused = pool.acquire(1);
        assert!(reused.is_empty());
        assert!(reused.capacity() >= 4);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn surplus_buffers_beyond_reserved_capacity_are_freed() {
        let pool = PointPool::new(1);
        let buffers: Vec<_> = (0..5).map(|_| pool.acquire(1)).collect();
        drop(buffers);

        let stats = pool.stats();
        assert_eq!(stats.free, 1);
        assert_eq!(stats.released, 5);
    }

    #[test]
    fn oversized_buffers_are_shrunk_on_release() {
        let pool = PointPool::with_limits(1, 16);
        let buffer = pool.acquire(1024);
        drop(buffer);

        let reused = pool.acquire(0);
        assert!(reused.capacity() < 1024);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_never_aliases_live_buffers() {
        let pool = PointPool::new(8);
        let live = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for task_id in 0..16i64 {
            let pool = pool.clone();
            let live = Arc::clone(&live);
            tasks.push(tokio::spawn(async move {
                for round in 0..200i64 {
                    let mut buffer = pool.acquire(4);
                    assert!(buffer.is_empty());

                    let addr = buffer.as_ptr() as usize;
                    assert!(live.lock().unwrap().insert(addr), "buffer storage aliased");

                    let marker = task_id * 1_000 + round;
                    buffer.push(point(marker));
                    tokio::task::yield_now().await;
                    assert_eq!(buffer.len(), 1);
                    assert_eq!(buffer[0].field("marker"), Some(&marker.into()));

                    assert!(live.lock().unwrap().remove(&addr));
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.acquired, 16 * 200);
        assert_eq!(stats.in_use(), 0);
    }
}
