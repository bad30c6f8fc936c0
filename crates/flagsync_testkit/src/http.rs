//! In-memory HTTP client.
//!
//! Buffered requests are answered from per-path scripts. Streaming
//! requests are answered from a queue of scripted streams whose lines are
//! pushed by the test through a [`StreamFeeder`].

use async_trait::async_trait;
use flagsync_engine::{
    HttpClient, HttpRequest, HttpResponse, HttpStreamResponse, LineStream, SyncError, SyncResult,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Reply {
    Response(HttpResponse),
    Fail { retryable: bool },
}

impl Reply {
    fn into_result(self) -> SyncResult<HttpResponse> {
        match self {
            Reply::Response(response) => Ok(response),
            Reply::Fail { retryable: true } => Err(SyncError::transport_retryable("fake failure")),
            Reply::Fail { retryable: false } => Err(SyncError::transport_fatal("fake failure")),
        }
    }
}

#[derive(Debug, Default)]
struct Replies {
    queue: VecDeque<Reply>,
    last: Option<Reply>,
}

impl Replies {
    fn next(&mut self) -> Option<Reply> {
        if let Some(reply) = self.queue.pop_front() {
            self.last = Some(reply.clone());
            return Some(reply);
        }
        self.last.clone()
    }
}

#[derive(Debug)]
enum ScriptedStream {
    Open(mpsc::UnboundedReceiver<String>),
    Status(u16),
    Fail { retryable: bool },
}

/// A request seen by the fake, with the (tokio) time it arrived.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Arrival time.
    pub at: Instant,
    /// The request.
    pub request: HttpRequest,
}

/// Scripted [`HttpClient`].
///
/// Replies for one path are consumed in order and the last one repeats.
/// Unscripted paths answer 404. A streaming request without a scripted
/// stream fails with a retryable transport error.
#[derive(Debug, Default)]
pub struct FakeHttpClient {
    routes: Mutex<HashMap<String, Replies>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    log: Mutex<Vec<RecordedRequest>>,
}

impl FakeHttpClient {
    /// Creates a fake with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, path: &str, reply: Reply) {
        self.routes
            .lock()
            .entry(path.to_string())
            .or_default()
            .queue
            .push_back(reply);
    }

    /// Scripts a response for `path`.
    pub fn respond(&self, path: &str, status: u16, body: impl Into<String>) {
        self.push(path, Reply::Response(HttpResponse::new(status, body)));
    }

    /// Scripts a 200 response for `path`.
    pub fn respond_ok(&self, path: &str, body: impl Into<String>) {
        self.respond(path, 200, body);
    }

    /// Scripts `count` identical responses for `path`.
    pub fn respond_times(&self, path: &str, count: usize, status: u16, body: &str) {
        for _ in 0..count {
            self.respond(path, status, body);
        }
    }

    /// Scripts a transport failure for `path`.
    pub fn fail(&self, path: &str, retryable: bool) {
        self.push(path, Reply::Fail { retryable });
    }

    /// Scripts a stream that opens with status 200.
    pub fn open_stream(&self) -> StreamFeeder {
        let (lines, receiver) = mpsc::unbounded_channel();
        self.streams.lock().push_back(ScriptedStream::Open(receiver));
        StreamFeeder { lines }
    }

    /// Scripts a stream answered with `status` and no body.
    pub fn reject_stream(&self, status: u16) {
        self.streams.lock().push_back(ScriptedStream::Status(status));
    }

    /// Scripts a stream that fails before a response.
    pub fn fail_stream(&self, retryable: bool) {
        self.streams
            .lock()
            .push_back(ScriptedStream::Fail { retryable });
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().clone()
    }

    /// Arrival times of the requests for `path`.
    pub fn request_times(&self, path: &str) -> Vec<Instant> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.request.url.path() == path)
            .map(|r| r.at)
            .collect()
    }

    /// Number of requests for `path`.
    pub fn requests_to(&self, path: &str) -> usize {
        self.request_times(path).len()
    }

    fn record(&self, request: &HttpRequest) {
        self.log.lock().push(RecordedRequest {
            at: Instant::now(),
            request: request.clone(),
        });
    }
}

#[async_trait]
impl HttpClient for FakeHttpClient {
    async fn request(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        self.record(&request);
        let reply = self
            .routes
            .lock()
            .get_mut(request.url.path())
            .and_then(Replies::next);
        match reply {
            Some(reply) => reply.into_result(),
            None => Ok(HttpResponse::new(404, "not found")),
        }
    }

    async fn stream_request(&self, request: HttpRequest) -> SyncResult<HttpStreamResponse> {
        self.record(&request);
        let scripted = self.streams.lock().pop_front();
        match scripted {
            Some(ScriptedStream::Open(lines)) => Ok(HttpStreamResponse {
                status: 200,
                body: Some(Box::new(ChannelLines { lines })),
            }),
            Some(ScriptedStream::Status(status)) => Ok(HttpStreamResponse { status, body: None }),
            Some(ScriptedStream::Fail { retryable: true }) => {
                Err(SyncError::transport_retryable("fake stream failure"))
            }
            Some(ScriptedStream::Fail { retryable: false }) => {
                Err(SyncError::transport_fatal("fake stream failure"))
            }
            None => Err(SyncError::transport_retryable("no stream scripted")),
        }
    }
}

struct ChannelLines {
    lines: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl LineStream for ChannelLines {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        Ok(self.lines.recv().await)
    }
}

/// Writes lines into a scripted stream.
///
/// Dropping the feeder (or calling [`StreamFeeder::close`]) ends the body.
#[derive(Debug, Clone)]
pub struct StreamFeeder {
    lines: mpsc::UnboundedSender<String>,
}

impl StreamFeeder {
    /// Sends one raw line. Returns false once the reader has gone away.
    pub fn send_line(&self, line: impl Into<String>) -> bool {
        self.lines.send(line.into()).is_ok()
    }

    /// Sends the lines of one block followed by the blank terminator.
    pub fn send_block<I, S>(&self, lines: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut delivered = true;
        for line in lines {
            delivered &= self.send_line(line);
        }
        delivered && self.send_line("")
    }

    /// Sends a keep-alive comment block.
    pub fn keep_alive(&self) -> bool {
        self.send_block([":keepalive"])
    }

    /// Ends the body.
    pub fn close(self) {}

    /// Returns true once the reader dropped the body.
    pub fn is_closed(&self) -> bool {
        self.lines.is_closed()
    }
}
