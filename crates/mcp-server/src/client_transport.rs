//! Client side of the three transports, for use with [`mcp_core::Client`].

use crate::transport::{LineStreamTransport, SESSION_HEADER};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use mcp_core::error::TransportError;
use mcp_core::jsonrpc::{self, Message};
use mcp_core::transport::{Inbound, Transport, TransportOptions};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);
const DELETE_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest event-stream line kept while waiting for its terminator.
pub const MAX_SSE_LINE_LEN: usize = 4 * 1024 * 1024;

fn http_error(err: reqwest::Error) -> TransportError {
    TransportError::Http(err.to_string())
}

fn url_error(err: url::ParseError) -> TransportError {
    TransportError::Http(format!("invalid URL: {}", err))
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if the server named the event.
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser. Chunks may split lines (and
/// UTF-8 sequences) anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    /// Dropping the rest of an oversized line.
    skipping: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            if self.skipping {
                self.skipping = false;
                continue;
            }
            let line = String::from_utf8_lossy(&raw[..end]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.line(line) {
                events.push(event);
            }
        }
        if self.buffer.len() > MAX_SSE_LINE_LEN {
            warn!(len = self.buffer.len(), "Discarding oversized event-stream line");
            self.buffer.clear();
            self.event = None;
            self.data.clear();
            self.skipping = true;
        }
        events
    }

    /// Bytes held for an unterminated line.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            let event = self.event.take();
            if self.data.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(SseEvent { event, data });
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            // id and retry carry nothing we act on.
            _ => {}
        }
        None
    }
}

/// Event reader over a streaming HTTP response body.
struct EventStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    ready: VecDeque<SseEvent>,
}

impl EventStream {
    fn new(response: reqwest::Response) -> Self {
        Self {
            body: response.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
        }
    }

    async fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.ready.extend(self.decoder.feed(&chunk)),
                Some(Err(e)) => {
                    warn!(error = %e, "Event stream failed");
                    return None;
                }
                None => return None,
            }
        }
    }
}

/// Forward `message` events to the inbound queue until the stream ends or
/// the transport shuts down, then close the queue.
async fn pump(
    mut events: EventStream,
    tx: mpsc::Sender<Bytes>,
    inbound: Arc<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next_event() => event,
        };
        let Some(event) = event else {
            debug!("Event stream ended");
            break;
        };
        match event.event.as_deref() {
            None | Some("message") => {
                if tx.send(Bytes::from(event.data)).await.is_err() {
                    break;
                }
            }
            Some(other) => debug!(event = other, "Ignoring event"),
        }
    }
    drop(tx);
    inbound.close();
}

/// Tie the caller's token to the transport's own shutdown token.
fn link(token: CancellationToken, shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => shutdown.cancel(),
            _ = shutdown.cancelled() => {}
        }
    });
}

/// Client for the HTTP-Streams transport.
///
/// The first message sent must be `initialize`: its response carries the
/// session id, after which the event stream is opened and every later
/// message is posted with the session header.
pub struct HttpStreamsClientTransport {
    http: reqwest::Client,
    endpoint: Url,
    session_id: Mutex<Option<String>>,
    inbound: Arc<Inbound>,
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl HttpStreamsClientTransport {
    pub fn new(base: &Url) -> Result<Self, TransportError> {
        Self::with_options(base, TransportOptions::default())
    }

    pub fn with_options(base: &Url, options: TransportOptions) -> Result<Self, TransportError> {
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: base.join("/mcp").map_err(url_error)?,
            session_id: Mutex::new(None),
            inbound: Arc::new(Inbound::new(options.queue_capacity)),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn open_session(&self, message: Bytes) -> Result<(), TransportError> {
        let is_initialize = matches!(
            jsonrpc::classify(&message),
            Ok(Message::Request(ref request)) if request.method == "initialize"
        );
        if !is_initialize {
            return Err(TransportError::Http(
                "no session: the first message must be initialize".into(),
            ));
        }

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(message)
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("initialize returned {}", status)));
        }
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| TransportError::Http("initialize response has no session id".into()))?;
        let reply = response.bytes().await.map_err(http_error)?;

        let stream = self
            .http
            .get(self.endpoint.clone())
            .header(SESSION_HEADER, session_id.as_str())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(http_error)?;
        let status = stream.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("event stream returned {}", status)));
        }

        let tx = self.inbound.sender().ok_or(TransportError::Closed)?;
        info!(session_id = %session_id, "Session established");
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(session_id);
        tokio::spawn(pump(
            EventStream::new(stream),
            tx,
            self.inbound.clone(),
            self.shutdown.clone(),
        ));

        self.inbound.push(reply);
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpStreamsClientTransport {
    async fn start(&self, token: CancellationToken) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        link(token, self.shutdown.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        Ok(())
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let Some(session_id) = self.session_id() else {
            return self.open_session(message).await;
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(SESSION_HEADER, session_id.as_str())
            .body(message)
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("POST {} returned {}", self.endpoint, status)));
        }
        Ok(())
    }

    fn receive(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound.take_receiver()
    }

    /// Ends the session on the server (best effort) and the local stream.
    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let session_id = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session_id) = session_id {
            let delete = self
                .http
                .delete(self.endpoint.clone())
                .header(SESSION_HEADER, session_id.as_str())
                .send();
            match tokio::time::timeout(DELETE_TIMEOUT, delete).await {
                Ok(Ok(response)) => debug!(status = %response.status(), "Session deleted"),
                Ok(Err(e)) => debug!(error = %e, "Failed to delete session"),
                Err(_) => debug!("Session delete timed out"),
            }
        }
        self.inbound.close();
        Ok(())
    }
}

/// Client for the SSE transport: one event stream from `/sse`, messages
/// posted to the endpoint the server announces on it.
pub struct SseClientTransport {
    http: reqwest::Client,
    base: Url,
    endpoint: Mutex<Option<Url>>,
    inbound: Arc<Inbound>,
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl SseClientTransport {
    pub fn new(base: Url) -> Self {
        Self::with_options(base, TransportOptions::default())
    }

    pub fn with_options(base: Url, options: TransportOptions) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            endpoint: Mutex::new(None),
            inbound: Arc::new(Inbound::new(options.queue_capacity)),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Message endpoint announced by the server, once connected.
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn connect(&self) -> Result<EventStream, TransportError> {
        let url = self.base.join("/sse").map_err(url_error)?;
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("event stream returned {}", status)));
        }

        let mut events = EventStream::new(response);
        let endpoint = tokio::time::timeout(ENDPOINT_TIMEOUT, async {
            loop {
                match events.next_event().await {
                    Some(event) if event.event.as_deref() == Some("endpoint") => {
                        return Ok(event.data)
                    }
                    Some(_) => continue,
                    None => {
                        return Err(TransportError::Http(
                            "event stream ended before the endpoint event".into(),
                        ))
                    }
                }
            }
        })
        .await
        .map_err(|_| TransportError::Http("timed out waiting for the endpoint event".into()))??;

        let endpoint = self.base.join(&endpoint).map_err(url_error)?;
        debug!(endpoint = %endpoint, "Received message endpoint");
        *self.endpoint.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoint);
        Ok(events)
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    async fn start(&self, token: CancellationToken) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        let events = match self.connect().await {
            Ok(events) => events,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let tx = self.inbound.sender().ok_or(TransportError::Closed)?;
        link(token, self.shutdown.clone());
        tokio::spawn(pump(events, tx, self.inbound.clone(), self.shutdown.clone()));
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        Ok(())
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let endpoint = self
            .endpoint()
            .ok_or_else(|| TransportError::Http("not connected".into()))?;
        let response = self
            .http
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(message)
            .send()
            .await
            .map_err(http_error)?;
        let status = response.status();
        if status != StatusCode::ACCEPTED && !status.is_success() {
            return Err(TransportError::Http(format!("POST {} returned {}", endpoint, status)));
        }
        Ok(())
    }

    fn receive(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound.take_receiver()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.inbound.close();
        Ok(())
    }
}

/// Line-stream transport over the stdio of a spawned server process.
pub struct ChildProcessTransport {
    inner: LineStreamTransport,
    child: tokio::sync::Mutex<Child>,
}

impl ChildProcessTransport {
    /// Spawn `command` (program and whitespace-separated arguments). The
    /// child's stderr is inherited so its logs stay visible.
    pub fn spawn(command: &str) -> Result<Self, TransportError> {
        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty server command")
        })?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "child stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "child stdout unavailable")
        })?;
        info!(program, pid = child.id(), "Spawned server process");

        Ok(Self {
            inner: LineStreamTransport::new(stdout, stdin),
            child: tokio::sync::Mutex::new(child),
        })
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    async fn start(&self, token: CancellationToken) -> Result<(), TransportError> {
        self.inner.start(token).await
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.inner.stop().await
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        self.inner.send(message).await
    }

    fn receive(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inner.receive()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await?;
        let mut child = self.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            debug!(%status, "Server process already exited");
            return Ok(());
        }
        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to stop server process");
        }
        Ok(())
    }
}
