use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::{
    compactor::CompactorStatsHandle,
    feeder::Feeder,
    point::{Category, Point},
    pooling::{PointBuffer, PointPool},
    runtime::Collector,
};
use kestrel_error::GenericError;

const SELF_INTERVAL: Duration = Duration::from_secs(10);

/// Reports the agent's own pipeline statistics as the `kestrel` measurement.
pub struct SelfStatsCollector {
    feeder: Feeder,
    compactor: CompactorStatsHandle,
    hostname: String,
}

impl SelfStatsCollector {
    /// Creates the collector, tagging its points with `hostname`.
    pub fn new(feeder: Feeder, compactor: CompactorStatsHandle, hostname: String) -> Self {
        Self {
            feeder,
            compactor,
            hostname,
        }
    }
}

#[async_trait]
impl Collector for SelfStatsCollector {
    fn name(&self) -> &str {
        "self"
    }

    fn category(&self) -> Category {
        Category::Metric
    }

    fn interval(&self) -> Duration {
        SELF_INTERVAL
    }

    async fn collect(&mut self, pool: &PointPool) -> Result<PointBuffer, GenericError> {
        let mut points = pool.acquire(1);
        let pool_stats = pool.stats();
        let compactor = self.compactor.snapshot();
        let inputs = self.feeder.input_stats();
        let election_suppressed = inputs.iter().map(|s| s.election_suppressed).sum::<u64>();

        let point = Point::builder("kestrel", Category::Metric)
            .tag("host", self.hostname.as_str())
            .field("pool_acquired", pool_stats.acquired)
            .field("pool_in_use", pool_stats.in_use())
            .field("pool_free", pool_stats.free as u64)
            .field("inputs", inputs.len() as u64)
            .field("election_suppressed", election_suppressed)
            .field("last_errors", self.feeder.last_errors().len() as u64)
            .field("flushes", compactor.flushes)
            .field("points_flushed", compactor.points_flushed)
            .field("points_dropped", compactor.points_dropped)
            .field("bodies", compactor.bodies)
            .build()?;
        points.push(point);
        Ok(points)
    }
}
