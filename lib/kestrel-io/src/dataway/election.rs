use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::election::{Campaign, LeaderElector};
use kestrel_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing::debug;

use super::Endpoint;

const ELECTION_PATH: &str = "/v1/election";
const HEARTBEAT_PATH: &str = "/v1/election/heartbeat";

#[derive(Debug, Deserialize)]
struct ElectionResponse {
    content: ElectionContent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ElectionContent {
    status: String,
    id: String,
    interval: u64,
    error_msg: String,
}

/// Leader election through the dataway's election API.
///
/// A follower campaigns at `/v1/election`; a leader renews its lease at `/v1/election/heartbeat`. Both requests carry
/// the election namespace and this instance's ID. The dataway answers with a status of `success` when the instance
/// holds leadership, and may shorten or lengthen the time until the next round.
pub struct DatawayElector {
    client: reqwest::Client,
    endpoint: Endpoint,
    namespace: String,
    id: String,
    default_interval: Duration,
    request_timeout: Duration,
}

impl DatawayElector {
    /// Creates an elector for the given namespace and instance ID.
    pub fn new<N, I>(client: reqwest::Client, endpoint: Endpoint, namespace: N, id: I) -> Self
    where
        N: Into<String>,
        I: Into<String>,
    {
        Self {
            client,
            endpoint,
            namespace: namespace.into(),
            id: id.into(),
            default_interval: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the time between rounds used when the dataway does not specify one.
    pub fn with_default_interval(mut self, interval: Duration) -> Self {
        self.default_interval = interval;
        self
    }

    /// Sets the deadline for each election request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl LeaderElector for DatawayElector {
    async fn campaign(&mut self, currently_leader: bool) -> Result<Campaign, GenericError> {
        let path = if currently_leader { HEARTBEAT_PATH } else { ELECTION_PATH };
        let url = self.endpoint.api_url(
            path,
            &[("namespace", self.namespace.as_str()), ("id", self.id.as_str())],
        );

        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .with_error_context(|| format!("Election request to {} failed.", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            return Err(generic_error!(
                "Election request to {} returned HTTP {}.",
                self.endpoint,
                status
            ));
        }

        let body = response
            .json::<ElectionResponse>()
            .await
            .error_context("Malformed election response.")?;
        let content = body.content;

        let is_leader = content.status == "success";
        if !is_leader && !content.error_msg.is_empty() {
            debug!(namespace = %self.namespace, leader = %content.id, reason = %content.error_msg, "Not elected.");
        }

        let next_round_in = if content.interval > 0 {
            Duration::from_secs(content.interval)
        } else {
            self.default_interval
        };

        Ok(Campaign {
            is_leader,
            next_round_in,
        })
    }
}
