//! Client-side correlator: issues requests over a transport and matches the
//! responses that come back to the callers waiting on them.

use crate::error::{ClientError, TransportError};
use crate::jsonrpc::{self, Message, Notification, Request, RequestId, Response};
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsResult, ServerInfo,
    Tool, PROTOCOL_VERSION,
};
use crate::transport::Transport;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<Response>>>;

pub struct Client {
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: PendingTable,
    notifications: broadcast::Sender<Notification>,
    shutdown: CancellationToken,
    /// Cancelled once the response loop has exited.
    disconnected: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("next_id", &self.next_id)
            .field("pending", &self.pending_calls())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Removes a pending entry when the waiting call goes away, whatever the
/// reason (response, cancellation, timeout, dropped future).
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (notifications, _) = broadcast::channel(64);
        Self {
            transport,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            notifications,
            shutdown: CancellationToken::new(),
            disconnected: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Start the transport and spawn the response-ingestion loop.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted.into());
        }
        self.transport.start(token.child_token()).await?;
        let mut inbound = self
            .transport
            .receive()
            .ok_or(TransportError::AlreadyStarted)?;

        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = client.shutdown.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                client.route_incoming(&message);
            }
            debug!("Client response loop exited");
            // Flag first: a call that registers after the clear sees it.
            client.disconnected.cancel();
            // Wake every waiter; their slots close without a value.
            client
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        });
        Ok(())
    }

    fn route_incoming(&self, message: &[u8]) {
        match jsonrpc::classify(message) {
            Ok(Message::Response(response)) => {
                let Some(id) = response.id.as_ref().and_then(RequestId::as_u64) else {
                    warn!(id = ?response.id, "Response without a known call id");
                    return;
                };
                let slot = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                match slot {
                    Some(slot) => {
                        if slot.send(response).is_err() {
                            debug!(id, "Caller stopped waiting before response arrived");
                        }
                    }
                    None => debug!(id, "Dropping response for unknown or completed call"),
                }
            }
            Ok(Message::Notification(notification)) => {
                debug!(method = %notification.method, "Server notification");
                let _ = self.notifications.send(notification);
            }
            Ok(Message::Request(request)) => {
                debug!(method = %request.method, "Ignoring server-initiated request");
            }
            Err(failure) => {
                warn!(reason = %failure.reason, raw = %failure.raw_lossy(), "Failed to parse message from server");
            }
        }
    }

    /// Send a request and wait for its response or for `cancel`.
    ///
    /// A protocol error from the peer is returned inside the `Response`; use
    /// [`Client::request`] to have it surfaced as `ClientError::Rpc`.
    pub async fn call(
        &self,
        cancel: &CancellationToken,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Response, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        if self.disconnected.is_cancelled() {
            return Err(self.gone());
        }

        let request = Request::new(id, method, params);
        let bytes = jsonrpc::encode(&request)?;
        self.transport.send(Bytes::from(bytes)).await?;

        tokio::select! {
            response = rx => response.map_err(|_| self.gone()),
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
        }
    }

    fn gone(&self) -> ClientError {
        if self.closed.load(Ordering::SeqCst) {
            ClientError::Closed
        } else {
            ClientError::ConnectionClosed
        }
    }

    pub async fn call_with_timeout(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let cancel = CancellationToken::new();
        tokio::time::timeout(timeout, self.call(&cancel, method, params))
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }

    /// Call and decode the result into `T`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let response = self.call(&CancellationToken::new(), method, params).await?;
        let result = response.into_result()?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fire-and-forget.
    pub async fn notify(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let bytes = jsonrpc::encode(&Notification::new(method, params))?;
        self.transport.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// `initialize`, then the `notifications/initialized` follow-up.
    pub async fn initialize(&self, client_info: ServerInfo) -> Result<InitializeResult, ClientError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: json!({}),
            client_info: Some(client_info),
        };
        let result: InitializeResult = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, ClientError> {
        let result: ListToolsResult = self.request("tools/list", None).await?;
        Ok(result.tools)
    }

    pub async fn call_tool(
        &self,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, ClientError> {
        let params = CallToolParams {
            name: name.into(),
            arguments,
        };
        self.request("tools/call", Some(serde_json::to_value(params)?))
            .await
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn pending_calls(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Fail every outstanding call with `Closed` and close the transport.
    /// The second call does nothing.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.transport.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{JsonRpcError, METHOD_NOT_FOUND};
    use crate::test_support::MockTransport;
    use tokio::sync::mpsc;

    async fn started() -> (Arc<Client>, Arc<MockTransport>, mpsc::UnboundedReceiver<Bytes>) {
        let (transport, sent) = MockTransport::new();
        let client = Arc::new(Client::new(transport.clone()));
        client.start(CancellationToken::new()).await.unwrap();
        (client, transport, sent)
    }

    async fn next_request(sent: &mut mpsc::UnboundedReceiver<Bytes>) -> Request {
        let bytes = sent.recv().await.expect("request should be sent");
        match jsonrpc::classify(&bytes).unwrap() {
            Message::Request(request) => request,
            other => panic!("expected Request, got {:?}", other),
        }
    }

    fn reply(transport: &MockTransport, id: &RequestId, result: Value) {
        let bytes = jsonrpc::encode(&Response::success(id.clone(), result)).unwrap();
        assert!(transport.inject(std::str::from_utf8(&bytes).unwrap()));
    }

    #[tokio::test]
    async fn call_is_resolved_by_matching_response() {
        let (client, transport, mut sent) = started().await;

        let caller = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(&CancellationToken::new(), "ping", None)
                    .await
            })
        };

        let request = next_request(&mut sent).await;
        assert_eq!(request.id, RequestId::from(1u64));
        assert_eq!(request.method, "ping");
        reply(&transport, &request.id, json!({"ok": true}));

        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.into_result().unwrap(), json!({"ok": true}));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_the_right_callers() {
        let (client, transport, mut sent) = started().await;

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.request::<String>("a", None).await })
        };
        let a = next_request(&mut sent).await;
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.request::<String>("b", None).await })
        };
        let b = next_request(&mut sent).await;
        assert_eq!(a.id, RequestId::from(1u64));
        assert_eq!(b.id, RequestId::from(2u64));

        reply(&transport, &b.id, json!("for b"));
        reply(&transport, &a.id, json!("for a"));

        assert_eq!(first.await.unwrap().unwrap(), "for a");
        assert_eq!(second.await.unwrap().unwrap(), "for b");
    }

    #[tokio::test]
    async fn duplicate_response_is_dropped_without_stalling() {
        let (client, transport, mut sent) = started().await;

        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.request::<u32>("x", None).await })
        };
        let request = next_request(&mut sent).await;
        reply(&transport, &request.id, json!(1));
        reply(&transport, &request.id, json!(2));
        assert_eq!(caller.await.unwrap().unwrap(), 1);

        // The loop is still alive after the duplicate.
        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.request::<u32>("y", None).await })
        };
        let request = next_request(&mut sent).await;
        reply(&transport, &request.id, json!(3));
        assert_eq!(caller.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn rpc_error_surfaces_through_request() {
        let (client, transport, mut sent) = started().await;
        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.request::<Value>("missing", None).await })
        };
        let request = next_request(&mut sent).await;
        let bytes = jsonrpc::encode(&Response::failure(
            Some(request.id),
            JsonRpcError::method_not_found("missing"),
        ))
        .unwrap();
        transport.inject(std::str::from_utf8(&bytes).unwrap());

        match caller.await.unwrap() {
            Err(ClientError::Rpc(err)) => assert_eq!(err.code, METHOD_NOT_FOUND),
            other => panic!("expected Rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_removes_pending_entry() {
        let (client, _transport, mut sent) = started().await;
        let cancel = CancellationToken::new();

        let caller = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.call(&cancel, "slow", None).await })
        };
        next_request(&mut sent).await;
        assert_eq!(client.pending_calls(), 1);

        cancel.cancel();
        assert!(matches!(caller.await.unwrap(), Err(ClientError::Cancelled)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_call_and_forgets_it() {
        let (client, _transport, _sent) = started().await;
        let result = client
            .call_with_timeout("slow", None, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ClientError::Timeout(d)) if d == Duration::from_secs(5)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn close_fails_outstanding_calls_and_is_idempotent() {
        let (client, _transport, mut sent) = started().await;
        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.call(&CancellationToken::new(), "slow", None).await })
        };
        next_request(&mut sent).await;

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(matches!(caller.await.unwrap(), Err(ClientError::Closed)));
        assert!(matches!(
            client.call(&CancellationToken::new(), "ping", None).await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn input_ending_fails_outstanding_calls() {
        let (client, transport, mut sent) = started().await;
        let caller = {
            let client = client.clone();
            tokio::spawn(async move { client.call(&CancellationToken::new(), "slow", None).await })
        };
        next_request(&mut sent).await;
        transport.close_inbound();
        assert!(matches!(
            caller.await.unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn calls_after_input_ended_fail_fast() {
        let (client, transport, _sent) = started().await;
        transport.close_inbound();

        for _ in 0..2 {
            let result = tokio::time::timeout(
                Duration::from_secs(1),
                client.call(&CancellationToken::new(), "ping", None),
            )
            .await
            .expect("call must not hang once the connection is gone");
            assert!(matches!(result, Err(ClientError::ConnectionClosed)));
        }

        let listed = tokio::time::timeout(Duration::from_secs(1), client.list_tools())
            .await
            .expect("list_tools must not hang once the connection is gone");
        assert!(matches!(listed, Err(ClientError::ConnectionClosed)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn notify_sends_no_id_and_registers_nothing() {
        let (client, _transport, mut sent) = started().await;
        client
            .notify("notifications/message", Some(json!({"level": "info"})))
            .await
            .unwrap();
        let bytes = sent.recv().await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], "notifications/message");
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn server_notifications_reach_subscribers() {
        let (client, transport, _sent) = started().await;
        let mut notifications = client.subscribe_notifications();
        transport.inject(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#);
        let notification = notifications.recv().await.unwrap();
        assert_eq!(notification.method, "notifications/tools/list_changed");
    }

    #[tokio::test]
    async fn initialize_sends_follow_up_notification() {
        let (client, transport, mut sent) = started().await;
        let caller = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .initialize(ServerInfo {
                        name: "test-client".into(),
                        version: "0.0.1".into(),
                    })
                    .await
            })
        };

        let request = next_request(&mut sent).await;
        assert_eq!(request.method, "initialize");
        let params = request.params.clone().unwrap();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["clientInfo"]["name"], "test-client");
        reply(
            &transport,
            &request.id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "srv", "version": "1"}
            }),
        );

        let result = caller.await.unwrap().unwrap();
        assert_eq!(result.server_info.name, "srv");

        let follow_up: Value = serde_json::from_slice(&sent.recv().await.unwrap()).unwrap();
        assert_eq!(follow_up["method"], "notifications/initialized");
    }
}
