//! Push ingestion.
//!
//! Accepts Prometheus-style metric pushes at `/<prefix>/metrics/job/<job>[/<label>/<value>...]`, converts them into
//! metric points tagged with the grouping key, and feeds them into the pipeline. The same server exposes `GET /stats`
//! with the feeder's input statistics and last errors.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use bytes::Bytes;
use http::{header, HeaderMap, StatusCode};
use kestrel_core::{
    feeder::{FeedError, FeedOption, Feeder, InputStats, LastErrorRecord},
    point::{unix_now_ns, Category, PointError},
    pooling::PointPool,
    runtime::{DrainGuard, ExitCoordinator, ExitSignal},
};
use metrics::counter;
use serde::Serialize;
use snafu::{ResultExt as _, Snafu};
use tokio::{net::TcpListener, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

mod convert;
pub use self::convert::Naming;
use self::convert::convert_samples;

mod decode;
use self::decode::{decode_body, ContentEncoding};

mod path;
pub use self::path::{is_valid_label_name, parse_grouping_path, GroupingKey};

mod proto;
use self::proto::parse_delimited;

mod text;
use self::text::parse_text;

/// Source name used for every pushed batch.
pub const PUSH_SOURCE: &str = "pushgateway";

/// Default limit on request bodies, before and after decompression.
pub const DEFAULT_MAX_BODY_SIZE: usize = 32 * 1024 * 1024;

const DELIMITED_PROTOBUF: &str = "application/vnd.google.protobuf";

/// Push ingestion error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PushError {
    /// The URL path is not a valid grouping key.
    #[snafu(display("Invalid push path: {}.", reason))]
    InvalidPath {
        /// What was wrong with the path.
        reason: String,
    },

    /// The body could not be decoded or parsed.
    #[snafu(display("Invalid push body: {}.", reason))]
    InvalidBody {
        /// What was wrong with the body.
        reason: String,
    },

    /// A sample could not be turned into a point.
    #[snafu(display("Invalid sample: {}", source))]
    InvalidPoint {
        /// Point error.
        source: PointError,
    },

    /// The pipeline rejected the points.
    #[snafu(display("Failed to feed pushed points: {}", source))]
    Feed {
        /// Feed error.
        source: FeedError,
    },

    /// The agent is shutting down.
    #[snafu(display("Agent is shutting down."))]
    ShuttingDown,

    /// The listener could not be bound.
    #[snafu(display("Failed to bind push listener on {}: {}", address, source))]
    Bind {
        /// Listen address.
        address: SocketAddr,

        /// I/O error.
        source: std::io::Error,
    },

    /// The server failed while running.
    #[snafu(display("Push server failed: {}", source))]
    Serve {
        /// I/O error.
        source: std::io::Error,
    },
}

impl PushError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPath { .. } | Self::InvalidBody { .. } | Self::InvalidPoint { .. } => StatusCode::BAD_REQUEST,
            Self::ShuttingDown | Self::Feed { source: FeedError::Stopping { .. } } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PushError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Push server settings.
#[derive(Clone, Debug)]
pub struct PushConfig {
    /// Listen address.
    pub listen_address: SocketAddr,

    /// Path prefix before `/metrics`.
    pub prefix: String,

    /// Measurement naming.
    pub naming: Naming,

    /// Largest accepted body, before and after decompression.
    pub max_body_size: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 9529)),
            prefix: String::new(),
            naming: Naming::default(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

#[derive(Clone)]
struct PushState {
    feeder: Feeder,
    pool: PointPool,
    naming: Arc<Naming>,
    exit: ExitSignal,
    max_body_size: usize,
}

/// Snapshot served at `GET /stats`.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    /// Per-source input statistics.
    pub inputs: Vec<InputStats>,

    /// Most recent failure per source and category.
    pub last_errors: Vec<LastErrorRecord>,
}

/// The push ingestion and status server.
pub struct PushServer {
    config: PushConfig,
    state: PushState,
}

impl PushServer {
    /// Creates a server that feeds pushed points through `feeder`.
    pub fn new(config: PushConfig, feeder: Feeder, pool: PointPool, exit: ExitSignal) -> Self {
        let state = PushState {
            feeder,
            pool,
            naming: Arc::new(config.naming.clone()),
            exit,
            max_body_size: config.max_body_size,
        };
        Self { config, state }
    }

    /// Builds the router.
    pub fn router(&self) -> Router {
        let push_routes = Router::new().route(
            "/metrics/{*grouping}",
            put(handle_push).post(handle_push).delete(handle_delete),
        );
        let push_routes = match normalize_prefix(&self.config.prefix) {
            Some(prefix) => Router::new().nest(&prefix, push_routes),
            None => push_routes,
        };

        push_routes
            .route("/stats", get(handle_stats))
            .layer(DefaultBodyLimit::max(self.config.max_body_size))
            .with_state(self.state.clone())
    }

    /// Binds the configured address and serves in the background until the exit signal fires.
    ///
    /// # Errors
    ///
    /// If the listener cannot be bound, an error is returned.
    pub async fn spawn(self, exit: &ExitCoordinator) -> Result<JoinHandle<()>, PushError> {
        let address = self.config.listen_address;
        let listener = TcpListener::bind(address).await.context(Bind { address })?;
        let guard = exit.register("push");

        info!(%address, prefix = %self.config.prefix, "Push ingestion listening.");
        Ok(tokio::spawn(async move {
            if let Err(e) = self.serve(listener, guard).await {
                error!(error = %e, "Push server stopped unexpectedly.");
            }
        }))
    }

    /// Serves on `listener` until the exit signal fires, then finishes in-flight requests.
    ///
    /// # Errors
    ///
    /// If the server fails, an error is returned.
    pub async fn serve(self, listener: TcpListener, guard: DrainGuard) -> Result<(), PushError> {
        let mut exit = guard.signal();
        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { exit.wait().await })
            .await
            .context(Serve)?;

        debug!("Push server stopped.");
        drop(guard);
        Ok(())
    }
}

fn normalize_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("/{}", trimmed))
    }
}

fn is_delimited_protobuf(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(DELIMITED_PROTOBUF) && v.contains("encoding=delimited"))
}

async fn handle_push(
    State(state): State<PushState>, Path(grouping): Path<String>, headers: HeaderMap, body: Bytes,
) -> Result<StatusCode, PushError> {
    let result = ingest(&state, &grouping, &headers, body).await;
    let outcome = match &result {
        Ok(_) => "accepted",
        Err(e) if e.status() == StatusCode::BAD_REQUEST => "invalid",
        Err(_) => "failed",
    };
    counter!("push_requests_total", "outcome" => outcome).increment(1);

    match result {
        Ok(points) => {
            debug!(grouping = %grouping, points, "Accepted push.");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            warn!(grouping = %grouping, error = %e, "Rejected push.");
            if e.status() == StatusCode::BAD_REQUEST {
                state
                    .feeder
                    .feed_last_error(Category::Metric, e.to_string(), &FeedOption::new(PUSH_SOURCE));
            }
            Err(e)
        }
    }
}

async fn ingest(state: &PushState, grouping: &str, headers: &HeaderMap, body: Bytes) -> Result<usize, PushError> {
    if state.exit.is_triggered() {
        return Err(PushError::ShuttingDown);
    }

    let start = Instant::now();
    let key = parse_grouping_path(grouping)?;

    let encoding = ContentEncoding::from_header(headers.get(header::CONTENT_ENCODING).and_then(|v| v.to_str().ok()));
    let body = decode_body(body, encoding, state.max_body_size).await?;

    let samples = if is_delimited_protobuf(headers) {
        parse_delimited(&body)?
    } else {
        let text = std::str::from_utf8(&body).map_err(|_| PushError::InvalidBody {
            reason: "text body is not valid UTF-8".to_string(),
        })?;
        parse_text(text)?
    };

    let converted = convert_samples(samples, &key, &state.naming, &state.pool, unix_now_ns())?;
    if converted.skipped > 0 {
        debug!(job = %key.job, skipped = converted.skipped, "Skipped non-finite samples.");
    }

    let points = converted.points.len();
    if points == 0 {
        return Ok(0);
    }

    let opts = FeedOption::new(PUSH_SOURCE)
        .with_cost(start.elapsed())
        .with_global_tags_suppressed(true);
    state
        .feeder
        .feed_v2(Category::Metric, converted.points, &opts)
        .await
        .context(Feed)?;
    Ok(points)
}

/// Grouping keys are not stored, so there is nothing to delete.
async fn handle_delete(Path(grouping): Path<String>) -> StatusCode {
    debug!(grouping = %grouping, "Ignoring push delete.");
    StatusCode::OK
}

async fn handle_stats(State(state): State<PushState>) -> Json<StatsSnapshot> {
    Json(StatsSnapshot {
        inputs: state.feeder.input_stats(),
        last_errors: state.feeder.last_errors().snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use async_compression::tokio::write::GzipEncoder;
    use kestrel_core::{
        feeder::{FeedBatch, GlobalTags},
        point::FieldValue,
    };
    use prost::Message as _;
    use serde_json::Value;
    use tokio::{io::AsyncWriteExt as _, sync::mpsc, time::timeout};

    use super::{proto::*, *};

    struct Harness {
        base: String,
        client: reqwest::Client,
        metrics: mpsc::Receiver<FeedBatch>,
        exit: ExitCoordinator,
    }

    impl Harness {
        async fn start(prefix: &str) -> Self {
            let exit = ExitCoordinator::new();
            let global_tags = GlobalTags {
                host: BTreeMap::from([("host".to_string(), "agent-1".to_string())]),
                election: BTreeMap::new(),
            };
            let (feeder, receivers) = Feeder::builder().global_tags(global_tags).build(exit.signal());
            let mut queues = receivers.into_inner();
            let index = queues
                .iter()
                .position(|(category, _)| *category == Category::Metric)
                .unwrap();
            let (_, metrics) = queues.swap_remove(index);

            let config = PushConfig {
                prefix: prefix.to_string(),
                ..Default::default()
            };
            let server = PushServer::new(config, feeder, PointPool::new(4), exit.signal());
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let guard = exit.register("push");
            tokio::spawn(server.serve(listener, guard));

            Self {
                base: format!("http://{}", addr),
                client: reqwest::Client::new(),
                metrics,
                exit,
            }
        }

        async fn next_batch(&mut self) -> FeedBatch {
            timeout(Duration::from_secs(5), self.metrics.recv()).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn text_push_is_tagged_with_grouping_key() {
        let mut harness = Harness::start("").await;
        let response = harness
            .client
            .put(format!("{}/metrics/job/batch/instance/host-1", harness.base))
            .body("cpu_usage{core=\"0\",instance=\"ignored\"} 0.5\ncpu_idle{core=\"0\",instance=\"ignored\"} 0.4\n")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let batch = harness.next_batch().await;
        assert_eq!(&*batch.source, PUSH_SOURCE);
        assert_eq!(batch.points.len(), 1);

        let point = &batch.points[0];
        assert_eq!(point.measurement(), "cpu");
        assert_eq!(point.tag("job"), Some("batch"));
        assert_eq!(point.tag("instance"), Some("host-1"));
        assert_eq!(point.tag("core"), Some("0"));
        assert_eq!(point.tag("host"), None);
        assert_eq!(point.field("usage"), Some(&FieldValue::Float(0.5)));
        assert_eq!(point.field("idle"), Some(&FieldValue::Float(0.4)));
    }

    #[tokio::test]
    async fn plain_text_push_becomes_one_point() {
        let mut harness = Harness::start("").await;
        let response = harness
            .client
            .put(format!("{}/metrics/job/batch1/instance/host-a", harness.base))
            .body("up 1")
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let batch = harness.next_batch().await;
        assert_eq!(batch.points.len(), 1);
        assert!(harness.metrics.try_recv().is_err());

        let point = &batch.points[0];
        assert_eq!(point.category(), Category::Metric);
        assert_eq!(point.measurement(), "up");
        assert_eq!(point.fields().len(), 1);
        assert_eq!(point.field("up"), Some(&FieldValue::Float(1.0)));

        let expected = BTreeMap::from([
            ("instance".to_string(), "host-a".to_string()),
            ("job".to_string(), "batch1".to_string()),
        ]);
        assert_eq!(point.tags(), &expected);
    }

    #[tokio::test]
    async fn empty_label_values_are_dropped() {
        let mut harness = Harness::start("").await;
        let response = harness
            .client
            .put(format!("{}/metrics/job/batch/instance@base64/=", harness.base))
            .body("up{foo=\"\",instance=\"body\"} 1 1\n")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let batch = harness.next_batch().await;
        let expected = BTreeMap::from([("job".to_string(), "batch".to_string())]);
        assert_eq!(batch.points[0].tags(), &expected);
    }

    #[tokio::test]
    async fn base64_job_under_prefix() {
        let mut harness = Harness::start("/push/").await;
        let response = harness
            .client
            .post(format!("{}/push/metrics/job@base64/YS9i", harness.base))
            .body("up 1\n")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let batch = harness.next_batch().await;
        assert_eq!(batch.points[0].tag("job"), Some("a/b"));
    }

    #[tokio::test]
    async fn malformed_pushes_are_rejected() {
        let harness = Harness::start("").await;

        let response = harness
            .client
            .put(format!("{}/metrics/job/batch/__reserved/x", harness.base))
            .body("up 1\n")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = harness
            .client
            .put(format!("{}/metrics/job/batch", harness.base))
            .body("up{ 1\n")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let stats: Value = harness
            .client
            .get(format!("{}/stats", harness.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let errors = stats["last_errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["source"], PUSH_SOURCE);
        assert!(errors[0]["message"].as_str().unwrap().starts_with("Invalid push body"));
    }

    #[tokio::test]
    async fn gzip_and_snappy_bodies() {
        let mut harness = Harness::start("").await;

        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(b"disk_free 10\n").await.unwrap();
        encoder.shutdown().await.unwrap();
        let response = harness
            .client
            .put(format!("{}/metrics/job/gz", harness.base))
            .header(header::CONTENT_ENCODING, "gzip")
            .body(encoder.into_inner())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(harness.next_batch().await.points[0].tag("job"), Some("gz"));

        let body = snap::raw::Encoder::new().compress_vec(b"disk_free 11\n").unwrap();
        let response = harness
            .client
            .put(format!("{}/metrics/job/sn", harness.base))
            .header(header::CONTENT_ENCODING, "snappy")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let batch = harness.next_batch().await;
        assert_eq!(batch.points[0].field("free"), Some(&FieldValue::Float(11.0)));
    }

    #[tokio::test]
    async fn delimited_protobuf_body() {
        let mut harness = Harness::start("").await;

        let family = MetricFamily {
            name: Some("queue_depth".to_string()),
            r#type: Some(MetricType::Gauge as i32),
            metric: vec![Metric {
                label: vec![LabelPair {
                    name: Some("queue".to_string()),
                    value: Some("high".to_string()),
                }],
                gauge: Some(Gauge { value: Some(12.0) }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut body = Vec::new();
        family.encode_length_delimited(&mut body).unwrap();

        let response = harness
            .client
            .put(format!("{}/metrics/job/worker", harness.base))
            .header(
                header::CONTENT_TYPE,
                "application/vnd.google.protobuf; encoding=delimited; proto=io.prometheus.client.MetricFamily",
            )
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let batch = harness.next_batch().await;
        let point = &batch.points[0];
        assert_eq!(point.measurement(), "queue");
        assert_eq!(point.tag("queue"), Some("high"));
        assert_eq!(point.field("depth"), Some(&FieldValue::Float(12.0)));
    }

    #[tokio::test]
    async fn delete_is_acknowledged_and_stats_are_served() {
        let mut harness = Harness::start("").await;

        let response = harness
            .client
            .delete(format!("{}/metrics/job/batch", harness.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        harness
            .client
            .put(format!("{}/metrics/job/batch", harness.base))
            .body("up 1\n")
            .send()
            .await
            .unwrap();
        harness.next_batch().await;

        let stats: Value = harness
            .client
            .get(format!("{}/stats", harness.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let inputs = stats["inputs"].as_array().unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0]["source"], PUSH_SOURCE);
        assert_eq!(inputs[0]["total_points"], 1);
    }

    #[tokio::test]
    async fn pushes_during_shutdown_are_refused() {
        let exit = ExitCoordinator::new();
        let (feeder, _receivers) = Feeder::builder().build(exit.signal());
        let state = PushState {
            feeder,
            pool: PointPool::new(1),
            naming: Arc::default(),
            exit: exit.signal(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        };
        exit.trigger();

        let err = ingest(&state, "job/late", &HeaderMap::new(), Bytes::from_static(b"up 1\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::ShuttingDown));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn server_drains_on_exit() {
        let harness = Harness::start("").await;
        harness.exit.trigger();
        timeout(Duration::from_secs(5), harness.exit.wait_for_drain(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();
    }
}
