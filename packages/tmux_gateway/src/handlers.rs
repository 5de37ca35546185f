//! HTTP endpoints: the WebSocket upgrade gate and the health probes.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::agentio::MAX_FILE_UPLOAD_BYTES;
use crate::ws::{self, Gateway};
use crate::wsbase::{is_authorized, origin_allowed};

/// Headroom over the upload cap for the envelope and JSON framing.
const READ_LIMIT_HEADROOM: usize = 64 * 1024;

/// `/ws`: token and origin check, then upgrade into the client loop.
pub async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());

    let authorized = is_authorized(
        &gateway.auth_token,
        auth_header,
        query.get("token").map(String::as_str),
    );
    if !authorized || !origin_allowed(&gateway.origin_patterns, origin) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.max_message_size(MAX_FILE_UPLOAD_BYTES + READ_LIMIT_HEADROOM)
        .on_upgrade(move |socket| ws::handle_socket(socket, gateway))
}

/// `/healthz`: liveness.
pub async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

/// `/readyz`: 200 once the control channel has listed sessions successfully.
pub async fn readyz(State(gateway): State<Arc<Gateway>>) -> Response {
    if gateway.ready.load(Ordering::Acquire) {
        Json(serde_json::json!({ "ready": true })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "ready": false,
                "error": "tmux control channel not ready"
            })),
        )
            .into_response()
    }
}
