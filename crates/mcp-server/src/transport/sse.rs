//! SSE transport: `GET /sse` opens a session stream, `POST /message` submits
//! messages for that session, replies come back on the stream.

use super::http::{
    event_data, is_valid_session_id, request_id, session_stream, HttpCore, HttpTransport,
    RoutingScheme,
};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

pub struct SseRouting;

pub type SseTransport = HttpTransport<SseRouting>;

impl RoutingScheme for SseRouting {
    const NAME: &'static str = "sse";
    const ALLOWED_METHODS: &'static str = "GET, POST, OPTIONS";

    fn routes(core: Arc<HttpCore>) -> Router {
        Router::new()
            .route("/sse", get(handle_sse))
            .route("/message", post(handle_message))
            .route("/health", get(handle_health))
            .with_state(core)
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Handle GET /sse: open a session, under a caller-chosen id if given.
async fn handle_sse(State(core): State<Arc<HttpCore>>, Query(query): Query<SessionQuery>) -> Response {
    if core.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server shutting down").into_response();
    }

    let requested = query.session_id.filter(|id| !id.is_empty());
    if let Some(id) = &requested {
        if !is_valid_session_id(id) {
            debug!(session_id = ?id, "Rejecting malformed session id");
            return (StatusCode::BAD_REQUEST, "Invalid sessionId parameter").into_response();
        }
    }

    let session = core.sessions.create(requested);
    let Some(queue) = session.attach() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Session unavailable").into_response();
    };
    info!(session_id = %session.id(), "SSE client connected");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/message?sessionId={}", session.id()));
    let events = session_stream(core, session, queue, endpoint, |message| {
        Event::default()
            .event("message")
            .data(event_data(message))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Handle POST /message?sessionId=ID.
async fn handle_message(
    State(core): State<Arc<HttpCore>>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing sessionId parameter").into_response();
    };
    let Some(session) = core.sessions.get(&session_id) else {
        debug!(session_id = %session_id, "Message for unknown session");
        return (StatusCode::BAD_REQUEST, "Invalid session ID").into_response();
    };

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        _ => return (StatusCode::BAD_REQUEST, "Invalid JSON").into_response(),
    };
    let method = value.get("method").and_then(|m| m.as_str()).unwrap_or("");
    debug!(session_id = %session_id, method = %method, "SSE message received");

    core.dispatch(&session, body, request_id(&value)).await;
    (StatusCode::ACCEPTED, "Accepted").into_response()
}

async fn handle_health(State(core): State<Arc<HttpCore>>) -> Json<Value> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Json(json!({
        "status": "ok",
        "clients": core.sessions.len(),
        "transport": "sse",
        "timestamp": timestamp,
    }))
}
