use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::point::Category;

/// The most recent failure reported for a source and category.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LastErrorRecord {
    /// Source (collector or pipeline stage) the failure is attributed to.
    pub source: String,

    /// Category the failure relates to.
    pub category: Category,

    /// Failure message.
    pub message: String,

    /// When a failure was first recorded for this source and category.
    pub first_seen: DateTime<Utc>,

    /// When the most recent failure was recorded.
    pub last_seen: DateTime<Utc>,
}

/// Shared table of [`LastErrorRecord`]s, one per source and category.
#[derive(Clone, Debug, Default)]
pub struct LastErrors {
    records: Arc<Mutex<HashMap<(String, Category), LastErrorRecord>>>,
}

impl LastErrors {
    /// Records a failure, replacing the message of any existing record for the same source and category.
    pub fn record<S, M>(&self, source: S, category: Category, message: M)
    where
        S: Into<String>,
        M: Into<String>,
    {
        let source = source.into();
        let message = message.into();
        let now = Utc::now();

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records
            .entry((source.clone(), category))
            .and_modify(|record| {
                record.message.clone_from(&message);
                record.last_seen = now;
            })
            .or_insert_with(|| LastErrorRecord {
                source,
                category,
                message,
                first_seen: now,
                last_seen: now,
            });
    }

    /// Returns the record for the given source and category, if any.
    pub fn get(&self, source: &str, category: Category) -> Option<LastErrorRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(source.to_string(), category))
            .cloned()
    }

    /// Returns every record, ordered by source and category.
    pub fn snapshot(&self) -> Vec<LastErrorRecord> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| (&a.source, a.category).cmp(&(&b.source, b.category)));
        records
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if no failures have been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Feed statistics for one source.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InputStats {
    /// Source name.
    pub source: String,

    /// Category of the most recent feed.
    pub category: Category,

    /// Points fed in total.
    pub total_points: u64,

    /// Number of accepted feed calls.
    pub feed_count: u64,

    /// Points discarded because the instance is not the election leader.
    pub election_suppressed: u64,

    /// Mean collection cost across feed calls.
    #[serde(with = "duration_millis")]
    pub avg_cost: Duration,

    /// Largest collection cost seen.
    #[serde(with = "duration_millis")]
    pub max_cost: Duration,

    /// When the source first fed points.
    pub first_feed: DateTime<Utc>,

    /// When the source last fed points.
    pub last_feed: DateTime<Utc>,
}

impl InputStats {
    /// Feed calls per minute, averaged over the time since the first feed.
    pub fn frequency_per_minute(&self) -> f64 {
        let elapsed = (self.last_feed - self.first_feed).num_milliseconds();
        if elapsed <= 0 {
            return self.feed_count as f64;
        }
        self.feed_count as f64 * 60_000.0 / elapsed as f64
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct InputStatsTable {
    inputs: Arc<Mutex<HashMap<String, InputStats>>>,
}

impl InputStatsTable {
    pub(crate) fn record_feed(&self, source: &str, category: Category, points: usize, cost: Duration) {
        self.update(source, category, |stats| {
            stats.total_points += points as u64;
            stats.feed_count += 1;

            let total_nanos = stats.avg_cost.as_nanos() * u128::from(stats.feed_count - 1) + cost.as_nanos();
            let avg_nanos = total_nanos / u128::from(stats.feed_count);
            stats.avg_cost = Duration::from_nanos(u64::try_from(avg_nanos).unwrap_or(u64::MAX));
            stats.max_cost = stats.max_cost.max(cost);
        });
    }

    pub(crate) fn record_suppressed(&self, source: &str, category: Category, points: usize) {
        self.update(source, category, |stats| {
            stats.election_suppressed += points as u64;
        });
    }

    fn update<F>(&self, source: &str, category: Category, f: F)
    where
        F: FnOnce(&mut InputStats),
    {
        let now = Utc::now();
        let mut inputs = self.inputs.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = inputs.entry(source.to_string()).or_insert_with(|| InputStats {
            source: source.to_string(),
            category,
            total_points: 0,
            feed_count: 0,
            election_suppressed: 0,
            avg_cost: Duration::ZERO,
            max_cost: Duration::ZERO,
            first_feed: now,
            last_feed: now,
        });
        stats.category = category;
        stats.last_feed = now;
        f(stats);
    }

    pub(crate) fn snapshot(&self) -> Vec<InputStats> {
        let mut inputs: Vec<_> = self
            .inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        inputs.sort_by(|a, b| a.source.cmp(&b.source));
        inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_record_per_source_and_category() {
        let errors = LastErrors::default();
        errors.record("cpu", Category::Metric, "first failure");
        errors.record("cpu", Category::Metric, "second failure");
        errors.record("cpu", Category::Object, "object failure");
        errors.record("disk", Category::Metric, "disk failure");

        assert_eq!(errors.len(), 3);

        let record = errors.get("cpu", Category::Metric).unwrap();
        assert_eq!(record.message, "second failure");
        assert!(record.first_seen <= record.last_seen);

        let sources: Vec<_> = errors
            .snapshot()
            .into_iter()
            .map(|r| (r.source, r.category))
            .collect();
        assert_eq!(
            sources,
            vec![
                ("cpu".to_string(), Category::Metric),
                ("cpu".to_string(), Category::Object),
                ("disk".to_string(), Category::Metric),
            ]
        );
    }

    #[test]
    fn feed_stats_accumulate() {
        let table = InputStatsTable::default();
        table.record_feed("cpu", Category::Metric, 10, Duration::from_millis(10));
        table.record_feed("cpu", Category::Metric, 5, Duration::from_millis(30));
        table.record_suppressed("cpu", Category::Metric, 3);

        let stats = table.snapshot().pop().unwrap();
        assert_eq!(stats.total_points, 15);
        assert_eq!(stats.feed_count, 2);
        assert_eq!(stats.election_suppressed, 3);
        assert_eq!(stats.max_cost, Duration::from_millis(30));
        assert_eq!(stats.avg_cost.as_millis(), 20);
    }
}
