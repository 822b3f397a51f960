//! HTTP-Streams transport. `initialize` is answered in the POST response and
//! creates a session; the peer then attaches `GET /mcp` as the session's event
//! stream, and every later reply travels over that stream.

use super::http::{
    event_data, request_id, session_stream, HttpCore, HttpTransport, RoutingScheme,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use mcp_core::jsonrpc::{self, JsonRpcError};
use mcp_core::session::SessionTable;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session header, lowercase as it appears on the wire.
pub const SESSION_HEADER: &str = "mcp-session-id";

pub struct StreamsRouting;

pub type HttpStreamsTransport = HttpTransport<StreamsRouting>;

impl RoutingScheme for StreamsRouting {
    const NAME: &'static str = "http-streams";
    const ALLOWED_METHODS: &'static str = "GET, POST, DELETE, OPTIONS";

    fn routes(core: Arc<HttpCore>) -> Router {
        Router::new()
            .route(
                "/mcp",
                get(handle_mcp_get)
                    .post(handle_mcp_post)
                    .delete(handle_mcp_delete),
            )
            .route("/health", get(handle_health))
            .with_state(core)
    }
}

/// Handle POST /mcp: `initialize` directly, everything else via the stream.
async fn handle_mcp_post(
    State(core): State<Arc<HttpCore>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response(),
    };
    let Some(method) = value
        .get("method")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "Missing or invalid method").into_response();
    };

    if method == "initialize" {
        return handle_initialize(&core, body).await;
    }

    let Some(session_id) = extract_session_id(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };
    let Some(session) = core.sessions.get(&session_id) else {
        debug!(session_id = %session_id, "POST for unknown session");
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };

    debug!(session_id = %session_id, method = %method, "MCP message received");
    core.dispatch(&session, body, request_id(&value)).await;
    (StatusCode::ACCEPTED, "Accepted").into_response()
}

async fn handle_initialize(core: &HttpCore, body: Bytes) -> Response {
    let Some(handler) = core.handler() else {
        warn!("initialize received with no message handler attached");
        return (StatusCode::INTERNAL_SERVER_ERROR, "No message handler").into_response();
    };
    if core.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server shutting down").into_response();
    }

    // Registered before the handler runs so the handler sees a live session.
    let session_id = SessionTable::generate_id();
    core.sessions.create(Some(session_id.clone()));

    let reply = match handler.handle_message(Some(&session_id), body).await {
        Ok(Some(reply)) => reply,
        Ok(None) => {
            core.sessions.remove(&session_id);
            return (StatusCode::INTERNAL_SERVER_ERROR, "No response to initialize")
                .into_response();
        }
        Err(err) => {
            warn!(error = %err, "initialize handler failed");
            core.sessions.remove(&session_id);
            let response = jsonrpc::Response::failure(
                None,
                JsonRpcError::internal_error("Internal error"),
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response();
        }
    };

    info!(session_id = %session_id, "MCP session created");
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        reply,
    )
        .into_response();
    if let Ok(val) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, val);
    }
    response
}

/// Handle GET /mcp: attach the session's event stream.
async fn handle_mcp_get(State(core): State<Arc<HttpCore>>, headers: HeaderMap) -> Response {
    let Some(session_id) = extract_session_id(&headers) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };
    let Some(session) = core.sessions.get(&session_id) else {
        return (StatusCode::NOT_FOUND, "Session not found").into_response();
    };
    let Some(queue) = session.attach() else {
        return (StatusCode::CONFLICT, "Session stream already attached").into_response();
    };
    info!(session_id = %session_id, "MCP session stream attached");

    let connected = Event::default().comment("connected");
    let events = session_stream(core, session, queue, connected, |message| {
        Event::default().data(event_data(message))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Handle DELETE /mcp: session termination.
async fn handle_mcp_delete(State(core): State<Arc<HttpCore>>, headers: HeaderMap) -> Response {
    let Some(session_id) = extract_session_id(&headers) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if core.sessions.remove(&session_id).is_some() {
        debug!(session_id = %session_id, "MCP session deleted");
        StatusCode::OK.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn handle_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Extract the mcp-session-id from request headers.
fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
