//! Delivery of heart rate readings to the local collector.
//!
//! Forwarding is fire-and-forget: one request per reading, no retries, no queue.
//! Every attempt is bounded by a timeout so a hung collector cannot stall the scan
//! pipeline or shutdown for long.

use reqwest::{Client, StatusCode, Url};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Collector endpoint of the HeartIO main program.
pub const DEFAULT_COLLECTOR_URL: &str = "http://127.0.0.1:2333/heart";

/// Upper bound for a single forward attempt.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(3);

/// Query parameter carrying the reading.
pub const BPM_PARAM: &str = "bpm";

/// Errors raised while setting up or performing a forward attempt.
#[derive(Error, Debug)]
pub enum ForwardError {
    /// The collector URL could not be parsed
    #[error("invalid collector URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    /// The HTTP client could not be constructed
    #[error("failed to create HTTP client: {0}")]
    Client(String),
    /// The collector answered with something other than 200 OK
    #[error("collector responded with status code {0}")]
    Status(u16),
    /// Connection, timeout or protocol failure
    #[error("request to collector failed: {0}")]
    Transport(String),
}

/// Boxed future returned by [`Forwarder::forward`].
pub type ForwardFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ForwardError>> + Send + 'a>>;

/// Destination for decoded readings.
///
/// Abstracted so the scan pipeline can be tested without a collector running.
pub trait Forwarder: Send + Sync {
    /// Make exactly one delivery attempt for `bpm`.
    fn forward(&self, bpm: u8) -> ForwardFuture<'_>;
}

/// Forwarder issuing `GET <collector>?bpm=<n>` requests.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client,
    url: Url,
}

impl HttpForwarder {
    /// Create a forwarder for `collector_url` whose requests give up after `timeout`.
    pub fn new(collector_url: &str, timeout: Duration) -> Result<Self, ForwardError> {
        let url = Url::parse(collector_url).map_err(|e| ForwardError::InvalidUrl {
            url: collector_url.to_string(),
            reason: e.to_string(),
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ForwardError::Client(e.to_string()))?;

        Ok(Self { client, url })
    }

    /// The collector endpoint, without the reading parameter.
    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn send(&self, bpm: u8) -> Result<(), ForwardError> {
        let response = self
            .client
            .get(self.url.clone())
            .query(&[(BPM_PARAM, bpm)])
            .send()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(ForwardError::Status(status.as_u16())),
        }
    }
}

impl Forwarder for HttpForwarder {
    fn forward(&self, bpm: u8) -> ForwardFuture<'_> {
        Box::pin(self.send(bpm))
    }
}
