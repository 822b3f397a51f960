//! Session-oriented HTTP transport shared by the SSE and HTTP-Streams
//! variants. The variants differ only in their routes, supplied through
//! [`RoutingScheme`].

use async_trait::async_trait;
use axum::{
    extract::Request,
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{sse::Event, IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use mcp_core::error::TransportError;
use mcp_core::jsonrpc::{self, JsonRpcError, RequestId};
use mcp_core::session::{Session, SessionTable};
use mcp_core::transport::{Inbound, MessageHandler, Transport, TransportOptions};
use serde_json::Value;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ALLOWED_HEADERS: &str = "Content-Type, Authorization, Mcp-Session-Id";

const MAX_SESSION_ID_LEN: usize = 128;

/// The route table of one HTTP transport variant.
pub trait RoutingScheme: Send + Sync + 'static {
    /// Transport name used in logs and health output.
    const NAME: &'static str;
    /// Value of `Access-Control-Allow-Methods`.
    const ALLOWED_METHODS: &'static str;

    fn routes(core: Arc<HttpCore>) -> Router;
}

/// State shared by the route handlers of one transport instance.
pub struct HttpCore {
    addr: String,
    pub(crate) sessions: SessionTable,
    pub(crate) inbound: Inbound,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    pub(crate) shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    server: tokio::sync::Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    options: TransportOptions,
}

impl HttpCore {
    fn new(addr: String, options: TransportOptions) -> Self {
        Self {
            addr,
            sessions: SessionTable::new(options.queue_capacity),
            inbound: Inbound::new(options.queue_capacity),
            handler: RwLock::new(None),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            server: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            options,
        }
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Route one inbound message from `session`.
    ///
    /// With a handler attached, the handler runs now and its reply (or an
    /// `InternalError` when it fails) is queued for `session` alone. Without
    /// one, the message goes to the shared inbound channel.
    pub(crate) async fn dispatch(&self, session: &Session, body: Bytes, id: Option<RequestId>) {
        let Some(handler) = self.handler() else {
            self.inbound.push(body);
            return;
        };

        match handler.handle_message(Some(session.id()), body).await {
            Ok(Some(reply)) => {
                session.deliver(reply);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(session_id = %session.id(), error = %err, "Message handler failed");
                let response =
                    jsonrpc::Response::failure(id, JsonRpcError::internal_error("Internal error"));
                match jsonrpc::encode(&response) {
                    Ok(bytes) => {
                        session.deliver(Bytes::from(bytes));
                    }
                    Err(e) => warn!(error = %e, "Failed to encode error response"),
                }
            }
        }
    }

    /// Drop sessions whose stream never attached, until shutdown.
    async fn expire_sessions(&self, name: &'static str) {
        let max_age = self.options.attach_timeout;
        let mut ticks = tokio::time::interval((max_age / 2).max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    let expired = self.sessions.expire_unattached(max_age);
                    if expired > 0 {
                        info!(transport = name, expired, "Dropped sessions that never attached a stream");
                    }
                }
            }
        }
    }

    /// Stop accepting connections and end every session stream.
    fn begin_shutdown(&self) {
        self.shutdown.cancel();
        self.sessions.close_all();
    }
}

/// Best-effort read of a JSON-RPC id from a decoded body.
pub(crate) fn request_id(value: &Value) -> Option<RequestId> {
    value
        .get("id")
        .filter(|id| !id.is_null())
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

/// Caller-chosen session ids must be short, plain URL-safe text.
pub(crate) fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~'))
}

/// Event payload for a queued message. An SSE field cannot carry a carriage
/// return; outside JSON strings it is only whitespace, so it becomes a line
/// break.
pub(crate) fn event_data(message: &Bytes) -> String {
    String::from_utf8_lossy(message).replace('\r', "\n")
}

/// Deregisters a session when its event stream ends, however it ends.
struct SessionGuard {
    core: Arc<HttpCore>,
    session: Arc<Session>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.session.detach();
        if self.core.sessions.remove_if_current(&self.session) {
            info!(session_id = %self.session.id(), "Session stream closed");
        }
    }
}

/// Event stream for an attached session: `preamble` first, then one event per
/// queued message. Ends when the transport shuts down or the session closes;
/// dropping it (client went away) ends the session as well.
pub(crate) fn session_stream(
    core: Arc<HttpCore>,
    session: Arc<Session>,
    queue: mpsc::Receiver<Bytes>,
    preamble: Event,
    frame: fn(&Bytes) -> Event,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let guard = SessionGuard { core, session };
    let first = stream::once(async move { Ok::<_, Infallible>(preamble) });
    let rest = stream::unfold((guard, queue), move |(guard, mut queue)| async move {
        let message = tokio::select! {
            _ = guard.core.shutdown.cancelled() => None,
            _ = guard.session.closed() => None,
            message = queue.recv() => message,
        };
        let Some(message) = message else {
            debug!(session_id = %guard.session.id(), "Session stream ending");
            return None;
        };
        Some((Ok::<_, Infallible>(frame(&message)), (guard, queue)))
    });
    first.chain(rest)
}

async fn cors<S: RoutingScheme>(req: Request, next: Next) -> Response {
    let mut resp = if req.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(S::ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    resp
}

/// An HTTP transport parameterized by its routing scheme.
pub struct HttpTransport<S> {
    core: Arc<HttpCore>,
    _scheme: PhantomData<fn() -> S>,
}

impl<S: RoutingScheme> HttpTransport<S> {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_options(addr, TransportOptions::default())
    }

    pub fn with_options(addr: impl Into<String>, options: TransportOptions) -> Self {
        Self {
            core: Arc::new(HttpCore::new(addr.into(), options)),
            _scheme: PhantomData,
        }
    }

    /// The full route table with CORS applied. Served by `start`; usable
    /// directly as a tower service.
    pub fn router(&self) -> Router {
        S::routes(self.core.clone()).layer(middleware::from_fn(cors::<S>))
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .core
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_count(&self) -> usize {
        self.core.sessions.len()
    }

    /// Queue `message` for one session only.
    pub fn send_to(&self, session_id: &str, message: Bytes) -> mcp_core::session::Delivery {
        self.core.sessions.send_to(session_id, message)
    }
}

#[async_trait]
impl<S: RoutingScheme> Transport for HttpTransport<S> {
    async fn start(&self, token: CancellationToken) -> Result<(), TransportError> {
        let core = &self.core;
        if core.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if core.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        let listener = match TcpListener::bind(&core.addr).await {
            Ok(listener) => listener,
            Err(source) => {
                core.started.store(false, Ordering::SeqCst);
                return Err(TransportError::Bind {
                    addr: core.addr.clone(),
                    source,
                });
            }
        };
        let local_addr = listener.local_addr()?;
        *core
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local_addr);

        let app = self.router();
        let shutdown = core.shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    debug!("Cancellation triggered, starting graceful shutdown");
                })
                .await
        });
        *core.server.lock().await = Some(server);

        let sweeper = core.clone();
        tokio::spawn(async move { sweeper.expire_sessions(S::NAME).await });

        let watcher = core.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => watcher.begin_shutdown(),
                _ = watcher.shutdown.cancelled() => {}
            }
        });

        info!(transport = S::NAME, addr = %local_addr, "HTTP transport listening");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.core.begin_shutdown();
        let Some(mut server) = self.core.server.lock().await.take() else {
            return Ok(());
        };

        let timeout = self.core.options.shutdown_timeout;
        match tokio::time::timeout(timeout, &mut server).await {
            Ok(Ok(Ok(()))) => {
                info!(transport = S::NAME, "HTTP server stopped");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(TransportError::Io(e)),
            Ok(Err(e)) => Err(TransportError::Http(e.to_string())),
            Err(_) => {
                warn!(transport = S::NAME, "Graceful shutdown timed out, aborting server");
                server.abort();
                Err(TransportError::ShutdownTimeout(timeout))
            }
        }
    }

    async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let delivered = self.core.sessions.broadcast(&message);
        debug!(transport = S::NAME, delivered, "Broadcast message");
        Ok(())
    }

    fn receive(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.core.inbound.take_receiver()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.stop().await;
        self.core.inbound.close();
        self.core
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(transport = S::NAME, "HTTP transport closed");
        result
    }

    fn set_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self
            .core
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SseTransport;
    use mcp_core::Server;
    use std::time::Duration;

    #[test]
    fn session_ids_are_plain_text() {
        assert!(is_valid_session_id("my-session_1.2~x"));
        assert!(is_valid_session_id(&SessionTable::generate_id()));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("a\rb"));
        assert!(!is_valid_session_id("a b"));
        assert!(!is_valid_session_id(&"x".repeat(MAX_SESSION_ID_LEN + 1)));
    }

    #[test]
    fn event_frames_never_carry_carriage_returns() {
        let data = event_data(&Bytes::from_static(b"{\"a\":\r\n1,\r\"b\":2}"));
        assert!(!data.contains('\r'));
        // Would panic inside axum if a carriage return slipped through.
        let _ = Event::default().data(data);
    }

    #[tokio::test]
    async fn close_twice_is_harmless() {
        let transport = Arc::new(SseTransport::new("127.0.0.1:0"));
        transport.start(CancellationToken::new()).await.unwrap();
        assert!(transport.local_addr().is_some());

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.send(Bytes::from_static(b"{}")).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport.start(CancellationToken::new()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let transport = SseTransport::new("127.0.0.1:0");
        transport.start(CancellationToken::new()).await.unwrap();
        assert!(matches!(
            transport.start(CancellationToken::new()).await,
            Err(TransportError::AlreadyStarted)
        ));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let first = SseTransport::new("127.0.0.1:0");
        first.start(CancellationToken::new()).await.unwrap();
        let taken = first.local_addr().unwrap().to_string();

        let second = SseTransport::new(taken);
        assert!(matches!(
            second.start(CancellationToken::new()).await,
            Err(TransportError::Bind { .. })
        ));
        first.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_start_token_ends_sessions() {
        let transport = SseTransport::new("127.0.0.1:0");
        let token = CancellationToken::new();
        transport.start(token.clone()).await.unwrap();

        let session = transport.core.sessions.create(None);
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("session should close on cancellation");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_without_handler_feeds_inbound() {
        let transport = SseTransport::new("127.0.0.1:0");
        let mut inbound = transport.receive().unwrap();
        let session = transport.core.sessions.create(None);
        transport
            .core
            .dispatch(&session, Bytes::from_static(b"{\"jsonrpc\":\"2.0\",\"method\":\"x\"}"), None)
            .await;
        assert_eq!(
            inbound.recv().await.unwrap(),
            Bytes::from_static(b"{\"jsonrpc\":\"2.0\",\"method\":\"x\"}")
        );
    }

    struct Failing;

    #[async_trait]
    impl MessageHandler for Failing {
        async fn handle_message(
            &self,
            _session_id: Option<&str>,
            _message: Bytes,
        ) -> anyhow::Result<Option<Bytes>> {
            anyhow::bail!("handler exploded")
        }
    }

    #[tokio::test]
    async fn failing_handler_queues_internal_error_for_the_session() {
        let transport = SseTransport::new("127.0.0.1:0");
        transport.set_message_handler(Arc::new(Failing));
        let session = transport.core.sessions.create(None);
        let mut queue = session.attach().unwrap();

        transport
            .core
            .dispatch(&session, Bytes::from_static(b"{}"), Some(RequestId::from(9u64)))
            .await;
        let value: Value = serde_json::from_slice(&queue.recv().await.unwrap()).unwrap();
        assert_eq!(value["id"], 9);
        assert_eq!(value["error"]["code"], jsonrpc::INTERNAL_ERROR);
        assert_eq!(value["error"]["message"], "Internal error");
    }

    #[tokio::test]
    async fn server_broadcast_reaches_attached_sessions() {
        let transport = Arc::new(SseTransport::new("127.0.0.1:0"));
        let server = Arc::new(Server::new(transport.clone()));
        server.start(CancellationToken::new()).await.unwrap();

        let a = transport.core.sessions.create(None);
        let b = transport.core.sessions.create(None);
        let mut a_queue = a.attach().unwrap();
        let mut b_queue = b.attach().unwrap();

        server
            .send_notification("notifications/message", None)
            .await
            .unwrap();
        for queue in [&mut a_queue, &mut b_queue] {
            let value: Value = serde_json::from_slice(&queue.recv().await.unwrap()).unwrap();
            assert_eq!(value["method"], "notifications/message");
        }
        server.close().await.unwrap();
    }
}
