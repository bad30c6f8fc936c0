//! Fetch collaborators used by the synchronizers and the authenticator.
//!
//! These traits abstract the request/response side of the control plane,
//! allowing for HTTP implementations ([`crate::http::HttpFetchers`]) and
//! mocks for testing.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;

/// Treatment served for a flag that does not name one.
pub const CONTROL_TREATMENT: &str = "control";

/// Lifecycle status of a flag definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagStatus {
    /// The flag is live.
    #[default]
    Active,
    /// The flag was removed and must be deleted locally.
    Archived,
}

fn control_treatment() -> String {
    CONTROL_TREATMENT.to_string()
}

/// A flag definition as delivered by the flags endpoint.
///
/// Only the fields the engine reads are typed; everything else is kept
/// verbatim in `attributes` for the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDefinition {
    /// Flag name.
    pub name: String,
    /// Change number of the last modification.
    #[serde(default)]
    pub change_number: i64,
    /// Lifecycle status.
    #[serde(default)]
    pub status: FlagStatus,
    /// Whether the flag is killed.
    #[serde(default)]
    pub killed: bool,
    /// Treatment served while killed.
    #[serde(default = "control_treatment")]
    pub default_treatment: String,
    /// Remaining definition fields.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl FlagDefinition {
    /// Creates an active, not killed definition.
    pub fn new(name: impl Into<String>, change_number: i64) -> Self {
        Self {
            name: name.into(),
            change_number,
            status: FlagStatus::Active,
            killed: false,
            default_treatment: control_treatment(),
            attributes: Map::new(),
        }
    }

    /// Marks the definition archived.
    pub fn archived(mut self) -> Self {
        self.status = FlagStatus::Archived;
        self
    }

    /// Returns true if the definition should be kept locally.
    pub fn is_active(&self) -> bool {
        self.status == FlagStatus::Active
    }
}

/// One page of flag changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagChanges {
    /// Change number the page starts from.
    pub since: i64,
    /// Change number the page brings the client to.
    pub till: i64,
    /// Changed definitions.
    #[serde(rename = "splits", default)]
    pub flags: Vec<FlagDefinition>,
}

impl FlagChanges {
    /// A page with no changes at `change_number`.
    pub fn unchanged(change_number: i64) -> Self {
        Self {
            since: change_number,
            till: change_number,
            flags: Vec::new(),
        }
    }
}

/// Response of the streaming authentication endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    /// Whether streaming is enabled for this environment.
    #[serde(default)]
    pub push_enabled: bool,
    /// Access token, present when streaming is enabled.
    #[serde(default)]
    pub token: Option<String>,
}

/// Fetches flag definitions.
#[async_trait]
pub trait FlagFetcher: Send + Sync {
    /// Fetches changes made after `since`.
    ///
    /// An empty page is `Ok`; only transport and decode failures are `Err`.
    async fn fetch_flags_since(&self, since: i64) -> SyncResult<FlagChanges>;
}

/// Fetches segment membership.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    /// Fetches the names of the segments `key` belongs to.
    async fn fetch_segments_for(&self, key: &str) -> SyncResult<Vec<String>>;
}

/// Requests streaming credentials.
#[async_trait]
pub trait AuthFetcher: Send + Sync {
    /// Requests a streaming token for `key`.
    async fn fetch_auth(&self, key: &str) -> SyncResult<AuthResponse>;
}

#[derive(Debug, Clone)]
enum MockOutcome<T> {
    Ok(T),
    Fail { retryable: bool },
}

impl<T: Clone> MockOutcome<T> {
    fn into_result(self, what: &str) -> SyncResult<T> {
        match self {
            MockOutcome::Ok(value) => Ok(value),
            MockOutcome::Fail { retryable: true } => {
                Err(SyncError::transport_retryable(format!("mock {what} failure")))
            }
            MockOutcome::Fail { retryable: false } => {
                Err(SyncError::transport_fatal(format!("mock {what} failure")))
            }
        }
    }
}

/// Scripted outcomes, consumed in order; the last one repeats.
#[derive(Debug)]
struct Script<T> {
    queue: VecDeque<MockOutcome<T>>,
    last: Option<MockOutcome<T>>,
}

impl<T> Default for Script<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            last: None,
        }
    }
}

impl<T: Clone> Script<T> {
    fn push(&mut self, outcome: MockOutcome<T>) {
        self.queue.push_back(outcome);
    }

    fn next(&mut self) -> Option<MockOutcome<T>> {
        if let Some(outcome) = self.queue.pop_front() {
            self.last = Some(outcome.clone());
            return Some(outcome);
        }
        self.last.clone()
    }
}

/// A mock fetcher for testing.
///
/// Outcomes are consumed in order and the last one repeats. Without any
/// scripted outcome flags are unchanged, segments are empty and auth fails.
#[derive(Debug, Default)]
pub struct MockFetcher {
    flags: Mutex<Script<FlagChanges>>,
    segments: Mutex<Script<Vec<String>>>,
    auth: Mutex<Script<AuthResponse>>,
    flag_requests: Mutex<Vec<i64>>,
    segment_requests: Mutex<Vec<String>>,
    auth_requests: Mutex<usize>,
}

impl MockFetcher {
    /// Creates a new mock fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a flags page.
    pub fn push_flags(&self, changes: FlagChanges) {
        self.flags.lock().push(MockOutcome::Ok(changes));
    }

    /// Scripts a flags failure.
    pub fn fail_flags(&self, retryable: bool) {
        self.flags.lock().push(MockOutcome::Fail { retryable });
    }

    /// Scripts a segments response.
    pub fn push_segments(&self, segments: &[&str]) {
        let segments = segments.iter().map(|s| s.to_string()).collect();
        self.segments.lock().push(MockOutcome::Ok(segments));
    }

    /// Scripts a segments failure.
    pub fn fail_segments(&self, retryable: bool) {
        self.segments.lock().push(MockOutcome::Fail { retryable });
    }

    /// Scripts an auth response.
    pub fn push_auth(&self, response: AuthResponse) {
        self.auth.lock().push(MockOutcome::Ok(response));
    }

    /// Scripts an auth failure.
    pub fn fail_auth(&self, retryable: bool) {
        self.auth.lock().push(MockOutcome::Fail { retryable });
    }

    /// The `since` values of every flags request, in order.
    pub fn flag_requests(&self) -> Vec<i64> {
        self.flag_requests.lock().clone()
    }

    /// Number of segments requests.
    pub fn segment_requests(&self) -> usize {
        self.segment_requests.lock().len()
    }

    /// Number of auth requests.
    pub fn auth_requests(&self) -> usize {
        *self.auth_requests.lock()
    }
}

#[async_trait]
impl FlagFetcher for MockFetcher {
    async fn fetch_flags_since(&self, since: i64) -> SyncResult<FlagChanges> {
        self.flag_requests.lock().push(since);
        match self.flags.lock().next() {
            Some(outcome) => outcome.into_result("flags"),
            None => Ok(FlagChanges::unchanged(since)),
        }
    }
}

#[async_trait]
impl SegmentFetcher for MockFetcher {
    async fn fetch_segments_for(&self, key: &str) -> SyncResult<Vec<String>> {
        self.segment_requests.lock().push(key.to_string());
        match self.segments.lock().next() {
            Some(outcome) => outcome.into_result("segments"),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl AuthFetcher for MockFetcher {
    async fn fetch_auth(&self, _key: &str) -> SyncResult<AuthResponse> {
        *self.auth_requests.lock() += 1;
        match self.auth.lock().next() {
            Some(outcome) => outcome.into_result("auth"),
            None => Err(SyncError::transport_fatal("no mock auth response set")),
        }
    }
}
