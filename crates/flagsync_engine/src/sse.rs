//! Streaming connection client.
//!
//! [`SseClient`] owns at most one open stream. Each `connect()` starts a
//! read task tagged with a new generation; everything the task observes is
//! reported as an [`SseConnectionEvent`] on the channel given at
//! construction. Disconnecting cancels the read task through a
//! [`CancellationToken`] and never produces an error event.

use crate::error::SyncResult;
use crate::http::{
    is_credentials_status, is_success_status, parse_url, HttpClient, HttpRequest,
    EVENT_STREAM_CONTENT_TYPE,
};
use flagsync_protocol::{EventFields, EventStreamParser, StreamBlock, STREAMING_PROTOCOL_VERSION};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// What a connection observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// The server accepted the stream.
    Open,
    /// A message block.
    Message(EventFields),
    /// A comment-only block.
    KeepAlive,
    /// The connection failed or was closed by the server.
    Error {
        /// False when the server rejected the credentials.
        recoverable: bool,
    },
    /// The connection was closed by the caller.
    Disconnected,
}

/// An [`SseEvent`] tagged with the generation of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseConnectionEvent {
    /// Generation returned by the `connect()` call that opened the stream.
    pub generation: u64,
    /// What happened.
    pub event: SseEvent,
}

/// Sender half of the connection event channel.
pub type SseEventSender = mpsc::UnboundedSender<SseConnectionEvent>;
/// Receiver half of the connection event channel.
pub type SseEventReceiver = mpsc::UnboundedReceiver<SseConnectionEvent>;

#[derive(Debug, Default)]
struct Connection {
    generation: u64,
    cancel: Option<CancellationToken>,
}

/// Builds the streaming URL for a token and its channels.
pub fn streaming_url(base: &Url, token: &str, channels: &[String]) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("v", STREAMING_PROTOCOL_VERSION)
        .append_pair("channel", &channels.join(","))
        .append_pair("accessToken", token);
    url
}

/// Client for the streaming endpoint.
pub struct SseClient {
    target: Url,
    http: Arc<dyn HttpClient>,
    events: SseEventSender,
    connection: Mutex<Connection>,
}

impl SseClient {
    /// Creates a client for `streaming_url` reporting on `events`.
    pub fn new(
        streaming_url: &str,
        http: Arc<dyn HttpClient>,
        events: SseEventSender,
    ) -> SyncResult<Self> {
        Ok(Self {
            target: parse_url(streaming_url)?,
            http,
            events,
            connection: Mutex::new(Connection::default()),
        })
    }

    /// Opens a stream, closing any previous one. Returns its generation.
    pub fn connect(&self, token: &str, channels: &[String]) -> u64 {
        self.disconnect();

        let url = streaming_url(&self.target, token, channels);
        let request =
            HttpRequest::get(url).with_header("Content-Type", EVENT_STREAM_CONTENT_TYPE);
        let cancel = CancellationToken::new();

        let generation = {
            let mut connection = self.connection.lock();
            connection.generation += 1;
            connection.cancel = Some(cancel.clone());
            connection.generation
        };
        tracing::debug!(generation, channels = channels.len(), "opening stream");

        let reader = ReadLoop {
            generation,
            http: self.http.clone(),
            events: self.events.clone(),
            cancel,
        };
        tokio::spawn(reader.run(request));
        generation
    }

    /// Closes the current stream. Idempotent.
    pub fn disconnect(&self) {
        let mut connection = self.connection.lock();
        let Some(cancel) = connection.cancel.take() else {
            return;
        };
        cancel.cancel();
        tracing::debug!(generation = connection.generation, "stream disconnected");
        let _ = self.events.send(SseConnectionEvent {
            generation: connection.generation,
            event: SseEvent::Disconnected,
        });
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        if let Some(cancel) = self.connection.lock().cancel.take() {
            cancel.cancel();
        }
    }
}

struct ReadLoop {
    generation: u64,
    http: Arc<dyn HttpClient>,
    events: SseEventSender,
    cancel: CancellationToken,
}

impl ReadLoop {
    fn emit(&self, event: SseEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(SseConnectionEvent {
            generation: self.generation,
            event,
        });
    }

    fn fail(&self, recoverable: bool) {
        self.emit(SseEvent::Error { recoverable });
    }

    async fn run(self, request: HttpRequest) {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return,
            response = self.http.stream_request(request) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                if !self.cancel.is_cancelled() {
                    tracing::warn!(error = %e, generation = self.generation, "stream request failed");
                }
                self.fail(!e.is_credentials_error());
                return;
            }
        };

        if !is_success_status(response.status) {
            tracing::warn!(status = response.status, "streaming endpoint rejected connection");
            self.fail(!is_credentials_status(response.status));
            return;
        }

        let Some(mut body) = response.body else {
            tracing::warn!("streaming response has no body");
            self.fail(true);
            return;
        };

        self.emit(SseEvent::Open);

        let mut parser = EventStreamParser::new();
        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = body.next_line() => line,
            };
            match line {
                Ok(Some(line)) => match parser.feed_line(&line) {
                    Some(StreamBlock::KeepAlive) => self.emit(SseEvent::KeepAlive),
                    Some(StreamBlock::Message(fields)) => self.emit(SseEvent::Message(fields)),
                    None => {}
                },
                Ok(None) => {
                    tracing::info!(generation = self.generation, "stream closed by server");
                    self.fail(true);
                    break;
                }
                Err(e) => {
                    if !self.cancel.is_cancelled() {
                        tracing::warn!(error = %e, generation = self.generation, "stream read failed");
                    }
                    self.fail(true);
                    break;
                }
            }
        }
        drop(body);
        tracing::debug!(generation = self.generation, "stream reader released");
    }
}
