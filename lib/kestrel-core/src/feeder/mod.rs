//! The ingestion facade every collector submits points through.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use metrics::counter;
use snafu::Snafu;
use tokio::{
    select,
    sync::{mpsc, watch},
};
use tracing::{debug, warn};

mod stats;
pub use self::stats::{InputStats, LastErrorRecord, LastErrors};
use self::stats::InputStatsTable;
use crate::{
    election::ElectionState,
    point::Category,
    pooling::PointBuffer,
    runtime::ExitSignal,
};

/// Default capacity of each per-category queue.
pub const DEFAULT_FEED_CHANNEL_SIZE: usize = 128;

/// Feed error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum FeedError {
    /// The category is unknown or disabled.
    #[snafu(display("Invalid category '{}'.", category))]
    InvalidCategory {
        /// The rejected category name.
        category: String,
    },

    /// The batch contained no points.
    #[snafu(display("Batch from '{}' contains no points.", source_name))]
    EmptyBatch {
        /// Source that submitted the batch.
        source_name: String,
    },

    /// A point's category did not match the category it was fed under.
    #[snafu(display(
        "Point '{}' has category '{}' but was fed as '{}'.",
        measurement,
        actual,
        expected
    ))]
    CategoryMismatch {
        /// Measurement of the offending point.
        measurement: String,

        /// Category the batch was fed under.
        expected: Category,

        /// Category of the offending point.
        actual: Category,
    },

    /// The pipeline is shutting down and no longer accepts points.
    #[snafu(display("Pipeline is stopping; batch from '{}' was not accepted.", source_name))]
    Stopping {
        /// Source that submitted the batch.
        source_name: String,
    },
}

/// Per-call metadata accompanying a feed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FeedOption {
    /// Name of the submitting collector.
    pub source: String,

    /// How long the collection took.
    pub cost: Duration,

    /// Whether the batch is suppressed on instances that are not the election leader.
    pub election_scope: bool,

    /// Whether global host or election tags are left off the points.
    pub suppress_global_tags: bool,
}

impl FeedOption {
    /// Creates options for the given source with every flag off.
    pub fn new<S: Into<String>>(source: S) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Sets the collection cost.
    pub fn with_cost(mut self, cost: Duration) -> Self {
        self.cost = cost;
        self
    }

    /// Marks the batch as election-scoped.
    pub fn with_election_scope(mut self, election_scope: bool) -> Self {
        self.election_scope = election_scope;
        self
    }

    /// Leaves global tags off the points.
    pub fn with_global_tags_suppressed(mut self, suppress: bool) -> Self {
        self.suppress_global_tags = suppress;
        self
    }
}

/// Tags applied to points unless a feed suppresses them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GlobalTags {
    /// Applied to points that are not election-scoped.
    pub host: BTreeMap<String, String>,

    /// Applied to election-scoped points.
    pub election: BTreeMap<String, String>,
}

impl GlobalTags {
    fn for_scope(&self, election_scope: bool) -> &BTreeMap<String, String> {
        if election_scope {
            &self.election
        } else {
            &self.host
        }
    }
}

/// A batch accepted by the feeder, on its way to the compactor.
pub struct FeedBatch {
    /// Name of the submitting collector.
    pub source: Arc<str>,

    /// The points, in submission order.
    pub points: PointBuffer,
}

impl fmt::Debug for FeedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedBatch")
            .field("source", &self.source)
            .field("points", &self.points.len())
            .finish()
    }
}

/// Receiving ends of the per-category queues, consumed by the compactor.
#[derive(Debug)]
pub struct FeedReceivers {
    receivers: Vec<(Category, mpsc::Receiver<FeedBatch>)>,
}

impl FeedReceivers {
    /// Returns the categories with an open queue.
    pub fn categories(&self) -> Vec<Category> {
        self.receivers.iter().map(|(category, _)| *category).collect()
    }

    /// Consumes the receivers.
    pub fn into_inner(self) -> Vec<(Category, mpsc::Receiver<FeedBatch>)> {
        self.receivers
    }
}

struct Inner {
    senders: Vec<Option<mpsc::Sender<FeedBatch>>>,
    global_tags: GlobalTags,
    election: watch::Receiver<ElectionState>,
    exit: ExitSignal,
    stats: InputStatsTable,
    last_errors: LastErrors,
}

/// Builder for [`Feeder`].
pub struct FeederBuilder {
    channel_size: usize,
    disabled: Vec<Category>,
    global_tags: GlobalTags,
    election: Option<watch::Receiver<ElectionState>>,
    last_errors: LastErrors,
}

impl FeederBuilder {
    /// Sets the capacity of each per-category queue.
    pub fn channel_size(mut self, channel_size: usize) -> Self {
        self.channel_size = channel_size.max(1);
        self
    }

    /// Rejects feeds for the given categories.
    pub fn disabled_categories<I: IntoIterator<Item = Category>>(mut self, categories: I) -> Self {
        self.disabled.extend(categories);
        self
    }

    /// Sets the global tags.
    pub fn global_tags(mut self, global_tags: GlobalTags) -> Self {
        self.global_tags = global_tags;
        self
    }

    /// Gates election-scoped feeds on the given leadership state.
    ///
    /// Without it, the instance is treated as the leader.
    pub fn election(mut self, election: watch::Receiver<ElectionState>) -> Self {
        self.election = Some(election);
        self
    }

    /// Shares the given last-error table instead of creating a new one.
    pub fn last_errors(mut self, last_errors: LastErrors) -> Self {
        self.last_errors = last_errors;
        self
    }

    /// Builds the feeder and the matching queue receivers.
    pub fn build(self, exit: ExitSignal) -> (Feeder, FeedReceivers) {
        let mut senders = Vec::with_capacity(Category::ALL.len());
        let mut receivers = Vec::new();
        for category in Category::ALL {
            if self.disabled.contains(&category) {
                senders.push(None);
                continue;
            }

            let (tx, rx) = mpsc::channel(self.channel_size);
            senders.push(Some(tx));
            receivers.push((category, rx));
        }

        let election = self.election.unwrap_or_else(|| {
            let (_, rx) = watch::channel(ElectionState::always_leader());
            rx
        });

        let feeder = Feeder {
            inner: Arc::new(Inner {
                senders,
                global_tags: self.global_tags,
                election,
                exit,
                stats: InputStatsTable::default(),
                last_errors: self.last_errors,
            }),
        };

        (feeder, FeedReceivers { receivers })
    }
}

/// The ingestion facade.
///
/// Feeding returns once the batch is accepted into its category queue, not once it is uploaded. When a queue is full,
/// feeding waits for space, which slows collectors down to the pace of the upload path.
#[derive(Clone)]
pub struct Feeder {
    inner: Arc<Inner>,
}

impl Feeder {
    /// Creates a builder.
    pub fn builder() -> FeederBuilder {
        FeederBuilder {
            channel_size: DEFAULT_FEED_CHANNEL_SIZE,
            disabled: Vec::new(),
            global_tags: GlobalTags::default(),
            election: None,
            last_errors: LastErrors::default(),
        }
    }

    /// Feeds a batch under a category given by name.
    ///
    /// `name` is the submitting collector and takes precedence over `opts.source`.
    ///
    /// # Errors
    ///
    /// If the category is unknown or disabled, or the batch is empty, an error is returned. See also
    /// [`feed_v2`][Self::feed_v2].
    pub async fn feed(
        &self, name: &str, category: &str, points: PointBuffer, opts: &FeedOption,
    ) -> Result<(), FeedError> {
        let category = category.parse::<Category>().map_err(|_| FeedError::InvalidCategory {
            category: category.to_string(),
        })?;

        if opts.source == name {
            self.feed_v2(category, points, opts).await
        } else {
            let opts = FeedOption {
                source: name.to_string(),
                ..opts.clone()
            };
            self.feed_v2(category, points, &opts).await
        }
    }

    /// Feeds a batch under the given category.
    ///
    /// Election-scoped batches fed while this instance is not the leader are accepted and discarded.
    ///
    /// # Errors
    ///
    /// If the category is disabled, the batch is empty, a point belongs to a different category, or the pipeline is
    /// shutting down, an error is returned and the batch is not enqueued.
    pub async fn feed_v2(&self, category: Category, mut points: PointBuffer, opts: &FeedOption) -> Result<(), FeedError> {
        let sender = self.inner.senders[category.index()]
            .as_ref()
            .ok_or_else(|| FeedError::InvalidCategory {
                category: category.to_string(),
            })?;

        if points.is_empty() {
            return Err(FeedError::EmptyBatch {
                source_name: opts.source.clone(),
            });
        }

        if let Some(point) = points.iter().find(|p| p.category() != category) {
            return Err(FeedError::CategoryMismatch {
                measurement: point.measurement().to_string(),
                expected: category,
                actual: point.category(),
            });
        }

        if self.inner.exit.is_triggered() {
            return Err(FeedError::Stopping {
                source_name: opts.source.clone(),
            });
        }

        if opts.election_scope && !self.inner.election.borrow().is_leader {
            debug!(source = %opts.source, %category, points = points.len(), "Discarding election-scoped batch on non-leader instance.");
            self.inner.stats.record_suppressed(&opts.source, category, points.len());
            counter!("feeder_points_suppressed_total", "category" => category.as_str()).increment(points.len() as u64);
            return Ok(());
        }

        if !opts.suppress_global_tags {
            let global_tags = self.inner.global_tags.for_scope(opts.election_scope);
            if !global_tags.is_empty() {
                for point in points.iter_mut() {
                    for (key, value) in global_tags {
                        point.insert_tag_if_absent(key, value);
                    }
                }
            }
        }

        let point_count = points.len();
        let batch = FeedBatch {
            source: Arc::from(opts.source.as_str()),
            points,
        };

        let mut exit = self.inner.exit.clone();
        let sent = select! {
            biased;
            _ = exit.wait() => false,
            result = sender.send(batch) => result.is_ok(),
        };
        if !sent {
            warn!(source = %opts.source, %category, "Rejected batch while pipeline is stopping.");
            return Err(FeedError::Stopping {
                source_name: opts.source.clone(),
            });
        }

        self.inner.stats.record_feed(&opts.source, category, point_count, opts.cost);
        counter!("feeder_points_total", "category" => category.as_str()).increment(point_count as u64);
        Ok(())
    }

    /// Records a collection failure for the source in `opts` and the given category.
    pub fn feed_last_error<M: Into<String>>(&self, category: Category, message: M, opts: &FeedOption) {
        let message = message.into();
        debug!(source = %opts.source, %category, error = %message, "Collector reported an error.");
        self.inner.last_errors.record(opts.source.as_str(), category, message);
    }

    /// Returns the shared last-error table.
    pub fn last_errors(&self) -> &LastErrors {
        &self.inner.last_errors
    }

    /// Returns a snapshot of per-source feed statistics.
    pub fn input_stats(&self) -> Vec<InputStats> {
        self.inner.stats.snapshot()
    }
}

impl fmt::Debug for Feeder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feeder").finish_non_exhaustive()
    }
}
