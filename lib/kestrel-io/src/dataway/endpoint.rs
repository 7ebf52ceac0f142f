use std::fmt;

use kestrel_core::point::Category;
use snafu::{ResultExt as _, Snafu};
use url::Url;

/// Endpoint configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EndpointError {
    /// The URL could not be parsed.
    #[snafu(display("Invalid dataway URL '{}': {}", url, source))]
    InvalidUrl {
        /// The configured URL.
        url: String,

        /// Parse error.
        source: url::ParseError,
    },

    /// The URL uses a scheme other than HTTP(S).
    #[snafu(display("Unsupported scheme '{}' in dataway URL; expected http or https.", scheme))]
    UnsupportedScheme {
        /// The configured scheme.
        scheme: String,
    },
}

/// One upload destination.
///
/// Built from a URL of the form `scheme://host[:port][?token=...]`. Any path is ignored; each category is written to
/// its own path on the host, carrying the original query string.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    base: Url,
    token: Option<String>,
}

impl Endpoint {
    /// Parses an endpoint URL.
    ///
    /// # Errors
    ///
    /// If the URL is malformed or does not use HTTP(S), an error is returned.
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let mut base = Url::parse(raw).context(InvalidUrl { url: raw })?;
        match base.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(EndpointError::UnsupportedScheme {
                    scheme: scheme.to_string(),
                })
            }
        }

        let token = base
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned());
        base.set_path("");
        base.set_fragment(None);

        Ok(Self { base, token })
    }

    /// Returns the workspace token carried in the URL, if any.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Returns the write URL for a category.
    pub fn category_url(&self, category: Category) -> Url {
        self.api_url(category.upload_path(), &[])
    }

    /// Returns the URL of an API path, with the configured query string followed by `extra_query`.
    pub fn api_url(&self, path: &str, extra_query: &[(&str, &str)]) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        if !extra_query.is_empty() {
            url.query_pairs_mut().extend_pairs(extra_query);
        }
        url
    }
}

impl fmt::Display for Endpoint {
    /// Formats the endpoint without its query string, so tokens never reach logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self.base.host_str().unwrap_or_default();
        match self.base.port() {
            Some(port) => write!(f, "{}://{}:{}", self.base.scheme(), host, port),
            None => write!(f, "{}://{}", self.base.scheme(), host),
        }
    }
}
