//! Upload client for the dataway.
//!
//! Every transaction is replicated to each configured endpoint independently. Each delivery is retried with
//! exponential backoff on transient failures and reported through the last-error table when it finally fails. A single
//! semaphore bounds the number of deliveries in flight across all endpoints.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use http::{header, HeaderValue};
use kestrel_core::{
    compactor::Transaction,
    feeder::LastErrors,
    runtime::{ExitCoordinator, ExitSignal},
};
use metrics::counter;
use snafu::{ResultExt as _, Snafu};
use tokio::{
    select,
    sync::{mpsc, Semaphore},
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tracing::{debug, info, warn};

mod election;
pub use self::election::DatawayElector;

mod endpoint;
pub use self::endpoint::{Endpoint, EndpointError};

mod retry;
pub use self::retry::ExponentialBackoff;
use self::retry::{classify_status, AttemptOutcome};

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of delivery attempts per endpoint.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Upper bound on the configurable number of delivery attempts.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Default number of deliveries allowed in flight at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

const LINE_PROTOCOL_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Upload error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum UploadError {
    /// An endpoint URL was invalid.
    #[snafu(display("Invalid endpoint: {}", source))]
    InvalidEndpoint {
        /// Endpoint error.
        source: EndpointError,
    },

    /// The HTTP client could not be built.
    #[snafu(display("Failed to build HTTP client: {}", source))]
    Client {
        /// Client error.
        source: reqwest::Error,
    },

    /// The body exceeds the maximum raw body size.
    #[snafu(display("PayloadTooLarge: body of {} bytes exceeds the maximum of {} bytes.", size, limit))]
    PayloadTooLarge {
        /// Raw body size, in bytes.
        size: usize,

        /// Configured maximum, in bytes.
        limit: usize,
    },

    /// The endpoint rejected the body.
    #[snafu(display("Upload to {} rejected: {}", endpoint, reason))]
    Rejected {
        /// Redacted endpoint.
        endpoint: String,

        /// Rejection reason.
        reason: String,
    },

    /// Every attempt failed.
    #[snafu(display("Upload to {} failed after {} attempt(s): {}", endpoint, attempts, reason))]
    RetriesExhausted {
        /// Redacted endpoint.
        endpoint: String,

        /// Attempts made.
        attempts: u32,

        /// Failure of the last attempt.
        reason: String,
    },

    /// The agent began shutting down before a retry could be made.
    #[snafu(display("Upload to {} abandoned during shutdown after {} attempt(s): {}", endpoint, attempts, reason))]
    Abandoned {
        /// Redacted endpoint.
        endpoint: String,

        /// Attempts made.
        attempts: u32,

        /// Failure of the last attempt.
        reason: String,
    },
}

/// Dataway client settings.
#[derive(Clone, Debug)]
pub struct DatawayConfig {
    /// Endpoint URLs. Every transaction goes to each of them.
    pub urls: Vec<String>,

    /// Deadline for a single request.
    pub request_timeout: Duration,

    /// Delivery attempts per transaction and endpoint, clamped to `1..=10`.
    pub max_attempts: u32,

    /// Backoff after the first failed attempt.
    pub backoff_base: Duration,

    /// Longest backoff between attempts.
    pub backoff_max: Duration,

    /// Largest raw body accepted for upload.
    pub max_raw_body_size: usize,

    /// Deliveries allowed in flight at once across all endpoints.
    pub max_in_flight: usize,

    /// `User-Agent` header value.
    pub user_agent: String,
}

impl Default for DatawayConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_raw_body_size: kestrel_core::compactor::DEFAULT_MAX_RAW_BODY_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            user_agent: concat!("kestrel/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

struct Inner {
    client: reqwest::Client,
    endpoints: Vec<Endpoint>,
    request_timeout: Duration,
    max_attempts: u32,
    backoff: ExponentialBackoff,
    max_raw_body_size: usize,
    max_in_flight: usize,
    last_errors: LastErrors,
}

/// The upload client.
#[derive(Clone)]
pub struct Dataway {
    inner: Arc<Inner>,
}

impl Dataway {
    /// Creates a client for the configured endpoints, reporting failures to `last_errors`.
    ///
    /// # Errors
    ///
    /// If an endpoint URL is invalid or the HTTP client cannot be built, an error is returned.
    pub fn new(config: DatawayConfig, last_errors: LastErrors) -> Result<Self, UploadError> {
        let endpoints = config
            .urls
            .iter()
            .map(|url| Endpoint::parse(url))
            .collect::<Result<Vec<_>, _>>()
            .context(InvalidEndpoint)?;

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .context(Client)?;

        for endpoint in &endpoints {
            info!(%endpoint, "Registered dataway endpoint.");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                endpoints,
                request_timeout: config.request_timeout,
                max_attempts: config.max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT),
                backoff: ExponentialBackoff::new(config.backoff_base, config.backoff_max),
                max_raw_body_size: config.max_raw_body_size,
                max_in_flight: config.max_in_flight.max(1),
                last_errors,
            }),
        })
    }

    /// Returns the configured endpoints.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.inner.endpoints
    }

    /// Returns the shared HTTP client.
    pub fn http_client(&self) -> reqwest::Client {
        self.inner.client.clone()
    }

    /// Uploads a transaction to every endpoint, waiting for all deliveries to finish.
    ///
    /// # Errors
    ///
    /// If the body is too large, or delivery to any endpoint ultimately fails, the first such error is returned. Each
    /// failure is also recorded in the last-error table.
    pub async fn upload(&self, transaction: &Transaction, exit: ExitSignal) -> Result<(), UploadError> {
        self.inner.check_size(transaction)?;

        let deliveries = self
            .inner
            .endpoints
            .iter()
            .map(|endpoint| self.inner.deliver_and_record(endpoint, transaction, exit.clone()));
        join_all(deliveries).await.into_iter().collect()
    }

    /// Spawns the upload loop.
    ///
    /// The loop runs until `transactions` closes, which happens once every compactor worker has drained, so batches
    /// flushed during shutdown are still delivered. Retries are abandoned once the exit signal fires.
    pub fn spawn(self, transactions: mpsc::Receiver<Transaction>, exit: &ExitCoordinator) -> JoinHandle<()> {
        let guard = exit.register("dataway");
        tokio::spawn(async move {
            self.run(transactions, guard.signal()).await;
            drop(guard);
        })
    }

    async fn run(self, mut transactions: mpsc::Receiver<Transaction>, exit: ExitSignal) {
        let in_flight = Arc::new(Semaphore::new(self.inner.max_in_flight));
        let mut deliveries = JoinSet::new();

        if self.inner.endpoints.is_empty() {
            warn!("No dataway endpoints configured. Uploads will be discarded.");
        }

        while let Some(transaction) = transactions.recv().await {
            while deliveries.try_join_next().is_some() {}

            if self.inner.endpoints.is_empty() {
                debug!(category = %transaction.category, points = transaction.body.point_count, "Discarding transaction.");
                continue;
            }

            if let Err(e) = self.inner.check_size(&transaction) {
                self.inner.record_failure(&transaction, &e);
                continue;
            }

            for index in 0..self.inner.endpoints.len() {
                // Waiting here pushes back on the compactor when too many deliveries are outstanding.
                let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
                    return;
                };

                let inner = Arc::clone(&self.inner);
                let transaction = transaction.clone();
                let exit = exit.clone();
                deliveries.spawn(async move {
                    let endpoint = &inner.endpoints[index];
                    let _ = inner.deliver_and_record(endpoint, &transaction, exit).await;
                    drop(permit);
                });
            }
        }

        debug!(pending = deliveries.len(), "Transaction queue closed. Waiting for in-flight deliveries.");
        while deliveries.join_next().await.is_some() {}
        info!("Dataway stopped.");
    }
}

impl Inner {
    fn check_size(&self, transaction: &Transaction) -> Result<(), UploadError> {
        if transaction.body.raw_size > self.max_raw_body_size {
            return Err(UploadError::PayloadTooLarge {
                size: transaction.body.raw_size,
                limit: self.max_raw_body_size,
            });
        }
        Ok(())
    }

    fn record_failure(&self, transaction: &Transaction, error: &UploadError) {
        warn!(category = %transaction.category, points = transaction.body.point_count, error = %error, "Dropping batch after failed upload.");
        let message = error.to_string();
        for source in transaction.sources.iter() {
            self.last_errors.record(source.as_ref(), transaction.category, message.as_str());
        }
    }

    async fn deliver_and_record(
        &self, endpoint: &Endpoint, transaction: &Transaction, exit: ExitSignal,
    ) -> Result<(), UploadError> {
        let category = transaction.category.as_str();
        let result = self.deliver(endpoint, transaction, exit).await;
        let outcome = match &result {
            Ok(()) => "delivered",
            Err(UploadError::Rejected { .. }) => "rejected",
            Err(UploadError::Abandoned { .. }) => "abandoned",
            Err(_) => "failed",
        };
        counter!("dataway_requests_total", "category" => category, "outcome" => outcome).increment(1);

        if let Err(e) = &result {
            self.record_failure(transaction, e);
        }
        result
    }

    async fn deliver(
        &self, endpoint: &Endpoint, transaction: &Transaction, mut exit: ExitSignal,
    ) -> Result<(), UploadError> {
        let url = endpoint.category_url(transaction.category);
        let category = transaction.category.as_str();

        let mut attempts = 0;
        loop {
            attempts += 1;
            counter!("dataway_request_attempts_total", "category" => category).increment(1);

            let reason = match self.attempt(url.clone(), transaction).await {
                AttemptOutcome::Delivered => {
                    debug!(%endpoint, category, attempts, bytes = transaction.body.payload.len(), "Delivered batch.");
                    return Ok(());
                }
                AttemptOutcome::Permanent(reason) => {
                    return Err(UploadError::Rejected {
                        endpoint: endpoint.to_string(),
                        reason,
                    })
                }
                AttemptOutcome::Transient(reason) => reason,
            };

            if attempts >= self.max_attempts {
                return Err(UploadError::RetriesExhausted {
                    endpoint: endpoint.to_string(),
                    attempts,
                    reason,
                });
            }

            let backoff = self.backoff.duration_for(attempts - 1);
            warn!(%endpoint, category, attempts, error = %reason, backoff_ms = backoff.as_millis() as u64, "Upload attempt failed. Retrying.");

            let abandoned = if exit.is_triggered() {
                true
            } else {
                select! {
                    biased;
                    _ = exit.wait() => true,
                    _ = sleep(backoff) => false,
                }
            };
            if abandoned {
                return Err(UploadError::Abandoned {
                    endpoint: endpoint.to_string(),
                    attempts,
                    reason,
                });
            }
        }
    }

    async fn attempt(&self, url: url::Url, transaction: &Transaction) -> AttemptOutcome {
        let body = &transaction.body;
        let mut request = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .header(header::CONTENT_TYPE, LINE_PROTOCOL_CONTENT_TYPE)
            .header("X-Points", HeaderValue::from(body.point_count))
            .body(body.payload.clone());
        if body.gzipped {
            request = request.header(header::CONTENT_ENCODING, "gzip");
        }

        match request.send().await {
            Ok(response) => classify_status(response.status()),
            Err(e) if e.is_timeout() => AttemptOutcome::Transient("request timed out".to_string()),
            Err(e) => AttemptOutcome::Transient(format!("request failed: {}", e.without_url())),
        }
    }
}
