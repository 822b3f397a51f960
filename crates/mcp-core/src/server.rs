//! The dispatcher: method tables, default MCP handlers, and the
//! message-processing loop that sits between a transport and the handlers.

use crate::error::{HandlerError, TransportError};
use crate::jsonrpc::{self, JsonRpcError, Message, Notification, Params, Request, RequestId, Response};
use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, ListToolsResult, ServerCapabilities,
    ServerInfo, ToolsCapability, PROTOCOL_VERSION,
};
use crate::tool::ToolRegistry;
use crate::transport::{MessageHandler, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-message context handed to every handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    /// `None` for notifications.
    pub id: Option<RequestId>,
    /// Originating session, when the transport knows it.
    pub session_id: Option<String>,
    /// Cancelled when the server stops.
    pub cancellation: CancellationToken,
}

pub type HandlerFuture<T> = BoxFuture<'static, Result<T, HandlerError>>;
pub type RequestHandler = Arc<dyn Fn(RequestContext, Params) -> HandlerFuture<Value> + Send + Sync>;
pub type NotificationHandler =
    Arc<dyn Fn(RequestContext, Params) -> HandlerFuture<()> + Send + Sync>;

fn request_handler<F, Fut>(handler: F) -> RequestHandler
where
    F: Fn(RequestContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |ctx, params| handler(ctx, params).boxed())
}

fn notification_handler<F, Fut>(handler: F) -> NotificationHandler
where
    F: Fn(RequestContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |ctx, params| handler(ctx, params).boxed())
}

pub struct Server {
    transport: Arc<dyn Transport>,
    handlers: DashMap<String, RequestHandler>,
    notification_handlers: DashMap<String, NotificationHandler>,
    info: ServerInfo,
    tools: Arc<ToolRegistry>,
    shutdown: CancellationToken,
    finished: CancellationToken,
    /// Set once the processing loop is spawned; only that loop then
    /// cancels `finished`.
    running: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("info", &self.info)
            .field("started", &self.started)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            handlers: DashMap::new(),
            notification_handlers: DashMap::new(),
            info: ServerInfo::default(),
            tools: Arc::new(ToolRegistry::new()),
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            running: AtomicBool::new(false),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_info(mut self, info: ServerInfo) -> Self {
        self.info = info;
        self
    }

    /// Back `tools/list` and `tools/call` with `tools`.
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Register a request handler. Replaces any handler for `method`,
    /// including a default one.
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(RequestContext, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.handlers.insert(method.into(), request_handler(handler));
    }

    pub fn register_notification_handler<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(RequestContext, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.notification_handlers
            .insert(method.into(), notification_handler(handler));
    }

    pub fn has_handler(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered request methods, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        methods.sort();
        methods
    }

    /// Fill every built-in slot that is still empty. Handlers registered
    /// beforehand win.
    pub fn install_default_handlers(&self) {
        let info = self.info.clone();
        self.handlers
            .entry("initialize".into())
            .or_insert_with(|| {
                request_handler(move |_ctx, params| {
                    let info = info.clone();
                    async move {
                        let params: InitializeParams = params.parse_or_default()?;
                        debug!(
                            client_version = %params.protocol_version,
                            client = ?params.client_info.as_ref().map(|c| &c.name),
                            "MCP initialize request"
                        );
                        let result = InitializeResult {
                            protocol_version: PROTOCOL_VERSION.into(),
                            capabilities: ServerCapabilities {
                                tools: Some(ToolsCapability { list_changed: true }),
                            },
                            server_info: info,
                        };
                        Ok::<Value, HandlerError>(serde_json::to_value(result)?)
                    }
                })
            });

        self.handlers.entry("ping".into()).or_insert_with(|| {
            request_handler(|_ctx, _params| async { Ok::<Value, HandlerError>(json!({})) })
        });

        let tools = self.tools.clone();
        self.handlers
            .entry("tools/list".into())
            .or_insert_with(|| {
                request_handler(move |_ctx, _params| {
                    let result = ListToolsResult {
                        tools: tools.definitions(),
                    };
                    async move { Ok::<Value, HandlerError>(serde_json::to_value(result)?) }
                })
            });

        let tools = self.tools.clone();
        self.handlers
            .entry("tools/call".into())
            .or_insert_with(|| {
                request_handler(move |ctx, params| {
                    let tools = tools.clone();
                    async move {
                        let params: CallToolParams = params.parse()?;
                        let result = tools.call(ctx, params).await?;
                        Ok::<Value, HandlerError>(serde_json::to_value(result)?)
                    }
                })
            });

        for method in ["notifications/initialized", "initialized"] {
            self.notification_handlers
                .entry(method.into())
                .or_insert_with(|| {
                    notification_handler(|ctx, _params| async move {
                        debug!(session_id = ?ctx.session_id, "Client initialized");
                        Ok::<(), HandlerError>(())
                    })
                });
        }
    }

    /// Install defaults and register as the transport's synchronous message
    /// handler. `start` does this; calling it alone serves a transport whose
    /// routes are driven directly.
    pub fn attach(self: &Arc<Self>) {
        self.install_default_handlers();
        self.transport
            .set_message_handler(Arc::new(Dispatch(Arc::downgrade(self))));
    }

    /// Install defaults, attach to the transport and start it, then spawn the
    /// processing loop. Returns once the transport is accepting input.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        self.attach();
        self.transport.start(token.child_token()).await?;

        let Some(mut inbound) = self.transport.receive() else {
            warn!("Transport inbound channel already taken; processing loop not started");
            self.finished.cancel();
            return Ok(());
        };

        self.running.store(true, Ordering::SeqCst);
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = server.shutdown.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                server.handle_inbound(&message).await;
            }
            debug!("Dispatcher loop exited");
            server.finished.cancel();
        });

        info!(server = %self.info.name, "MCP server started");
        Ok(())
    }

    /// Process one message from the shared inbound channel and send any
    /// response back through the transport.
    async fn handle_inbound(&self, message: &[u8]) {
        let Some(response) = self.process(None, message).await else {
            return;
        };
        match jsonrpc::encode(&response) {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(Bytes::from(bytes)).await {
                    warn!(error = %e, "Failed to send response");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode response"),
        }
    }

    /// Classify and handle one raw message. Returns the response to deliver,
    /// if the message calls for one.
    pub async fn process(&self, session_id: Option<&str>, message: &[u8]) -> Option<Response> {
        match jsonrpc::classify(message) {
            Ok(Message::Request(request)) => Some(self.handle_request(session_id, request).await),
            Ok(Message::Notification(notification)) => {
                self.handle_notification(session_id, notification).await;
                None
            }
            Ok(Message::Response(response)) => {
                debug!(id = ?response.id, "Ignoring response sent to server");
                None
            }
            Err(failure) => {
                warn!(
                    kind = ?failure.kind,
                    reason = %failure.reason,
                    raw = %failure.raw_lossy(),
                    "Failed to parse message"
                );
                Some(Response::failure(None, failure.to_error()))
            }
        }
    }

    async fn handle_request(&self, session_id: Option<&str>, request: Request) -> Response {
        // Clone out of the table so no shard lock is held across the await.
        let handler = self
            .handlers
            .get(&request.method)
            .map(|entry| entry.value().clone());
        let Some(handler) = handler else {
            debug!(method = %request.method, id = %request.id, "Method not found");
            return Response::failure(
                Some(request.id),
                JsonRpcError::method_not_found(&request.method),
            );
        };

        debug!(method = %request.method, id = %request.id, "Handling request");
        let ctx = RequestContext {
            method: request.method.clone(),
            id: Some(request.id.clone()),
            session_id: session_id.map(str::to_owned),
            cancellation: self.shutdown.child_token(),
        };
        match handler(ctx, Params::new(request.params)).await {
            Ok(result) => Response::success(request.id, result),
            Err(err) => {
                let error = err.into_rpc_error();
                debug!(
                    method = %request.method,
                    code = error.code,
                    message = %error.message,
                    "Handler returned error"
                );
                Response::failure(Some(request.id), error)
            }
        }
    }

    async fn handle_notification(&self, session_id: Option<&str>, notification: Notification) {
        let handler = self
            .notification_handlers
            .get(&notification.method)
            .map(|entry| entry.value().clone());
        let Some(handler) = handler else {
            debug!(method = %notification.method, "No handler for notification");
            return;
        };

        let ctx = RequestContext {
            method: notification.method.clone(),
            id: None,
            session_id: session_id.map(str::to_owned),
            cancellation: self.shutdown.child_token(),
        };
        if let Err(err) = handler(ctx, Params::new(notification.params)).await {
            warn!(method = %notification.method, error = %err, "Notification handler failed");
        }
    }

    /// Push an unsolicited notification to every peer of the transport.
    pub async fn send_notification(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), TransportError> {
        let notification = Notification::new(method, params);
        let bytes = jsonrpc::encode(&notification)?;
        self.transport.send(Bytes::from(bytes)).await
    }

    /// Stop processing and stop the transport. Idempotent. A message being
    /// handled when this is called still runs to completion before `wait`
    /// returns.
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        self.finish_if_idle();
        self.transport.stop().await
    }

    fn finish_if_idle(&self) {
        if !self.running.load(Ordering::SeqCst) {
            self.finished.cancel();
        }
    }

    /// Stop, then close the transport. The second call does nothing.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.finish_if_idle();
        info!(server = %self.info.name, "MCP server closing");
        self.transport.close().await
    }

    /// Resolves when the processing loop has ended, either because the
    /// transport's inbound channel closed or the server was stopped.
    pub async fn wait(&self) {
        self.finished.cancelled().await;
    }
}

/// Attaches a server to a transport's synchronous hook without keeping the
/// server alive.
struct Dispatch(Weak<Server>);

#[async_trait]
impl MessageHandler for Dispatch {
    async fn handle_message(
        &self,
        session_id: Option<&str>,
        message: Bytes,
    ) -> anyhow::Result<Option<Bytes>> {
        let Some(server) = self.0.upgrade() else {
            anyhow::bail!("server has been dropped");
        };
        match server.process(session_id, &message).await {
            Some(response) => Ok(Some(Bytes::from(jsonrpc::encode(&response)?))),
            None => Ok(None),
        }
    }
}
