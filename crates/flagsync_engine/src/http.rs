//! HTTP collaborator seam.
//!
//! The engine does not ship an HTTP stack. The actual client is abstracted
//! via [`HttpClient`] so that any library (hyper, reqwest, a platform
//! networking layer) or a fake can be plugged in. [`HttpFetchers`] builds
//! the fetch and auth collaborators on top of it.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{AuthFetcher, AuthResponse, FlagChanges, FlagFetcher, SegmentFetcher};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Content type requested from the streaming endpoint.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// An outgoing GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Full URL including the query.
    pub url: Url,
    /// Request headers.
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// Creates a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the first header with `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body as text.
    pub body: String,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        is_success_status(self.status)
    }
}

/// Returns true for 2xx statuses.
pub fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Returns true for statuses that reject the client's credentials.
pub fn is_credentials_status(status: u16) -> bool {
    status == 401 || status == 403
}

/// A body read line by line.
#[async_trait]
pub trait LineStream: Send {
    /// Reads the next line without its terminator; `None` at end of stream.
    async fn next_line(&mut self) -> std::io::Result<Option<String>>;
}

/// A streaming response: status plus an unread body.
pub struct HttpStreamResponse {
    /// Status code.
    pub status: u16,
    /// Body, absent when the server sent none.
    pub body: Option<Box<dyn LineStream>>,
}

impl fmt::Debug for HttpStreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStreamResponse")
            .field("status", &self.status)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and buffers the response body.
    ///
    /// Non-2xx statuses are returned as responses; only failures to obtain
    /// a response are errors.
    async fn request(&self, request: HttpRequest) -> SyncResult<HttpResponse>;

    /// Sends a request and returns the body as a line stream.
    async fn stream_request(&self, request: HttpRequest) -> SyncResult<HttpStreamResponse>;
}

#[derive(Debug, Deserialize)]
struct SegmentRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SegmentsResponse {
    #[serde(rename = "mySegments", default)]
    segments: Vec<SegmentRef>,
}

/// Appends path segments to a base URL, percent-encoding each one.
pub(crate) fn endpoint_url(base: &Url, segments: &[&str]) -> SyncResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| SyncError::transport_fatal(format!("{base} cannot be used as a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Parses a configured URL.
pub(crate) fn parse_url(raw: &str) -> SyncResult<Url> {
    Url::parse(raw).map_err(|e| SyncError::transport_fatal(format!("invalid url {raw}: {e}")))
}

/// Fetch and auth collaborators over an [`HttpClient`].
pub struct HttpFetchers {
    sdk_url: Url,
    auth_url: Url,
    client: Arc<dyn HttpClient>,
}

impl HttpFetchers {
    /// Creates fetchers for the given base URLs.
    pub fn new(sdk_url: &str, auth_url: &str, client: Arc<dyn HttpClient>) -> SyncResult<Self> {
        Ok(Self {
            sdk_url: parse_url(sdk_url)?,
            auth_url: parse_url(auth_url)?,
            client,
        })
    }

    /// Creates fetchers for the endpoints of a configuration.
    pub fn from_config(config: &SyncConfig, client: Arc<dyn HttpClient>) -> SyncResult<Self> {
        Self::new(&config.sdk_url, &config.auth_url, client)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, endpoint: &str) -> SyncResult<T> {
        tracing::debug!(%url, "requesting {endpoint}");
        let response = self.client.request(HttpRequest::get(url)).await?;
        if !response.is_success() {
            tracing::warn!(status = response.status, "{endpoint} request failed");
            return Err(SyncError::http_status(endpoint, response.status));
        }
        serde_json::from_str(&response.body).map_err(|e| SyncError::malformed(endpoint, e))
    }
}

impl fmt::Debug for HttpFetchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetchers")
            .field("sdk_url", &self.sdk_url.as_str())
            .field("auth_url", &self.auth_url.as_str())
            .finish()
    }
}

#[async_trait]
impl FlagFetcher for HttpFetchers {
    async fn fetch_flags_since(&self, since: i64) -> SyncResult<FlagChanges> {
        let mut url = endpoint_url(&self.sdk_url, &["splitChanges"])?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_string());
        self.get_json(url, "/splitChanges").await
    }
}

#[async_trait]
impl SegmentFetcher for HttpFetchers {
    async fn fetch_segments_for(&self, key: &str) -> SyncResult<Vec<String>> {
        let url = endpoint_url(&self.sdk_url, &["mySegments", key])?;
        let response: SegmentsResponse = self.get_json(url, "/mySegments").await?;
        Ok(response.segments.into_iter().map(|s| s.name).collect())
    }
}

#[async_trait]
impl AuthFetcher for HttpFetchers {
    async fn fetch_auth(&self, key: &str) -> SyncResult<AuthResponse> {
        let mut url = endpoint_url(&self.auth_url, &["auth"])?;
        url.query_pairs_mut().append_pair("users", key);
        self.get_json(url, "/auth").await
    }
}
