use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{header::SET_COOKIE, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    error::LensError,
    gate::{Admission, GateRequest},
    proxy::{self, ForwardedHeaders, StreamParams},
    state::{AppState, HLS_COOKIE},
};

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub url: Option<String>,
    pub entity: Option<String>,
    pub server: Option<String>,
    pub embed: Option<String>,
    #[serde(rename = "authSig")]
    pub auth_sig: Option<String>,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Query(query): Query<WsQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let admission = match admit(&state, &query, &headers, uri.path()) {
        Ok(admission) => admission,
        Err(err) => return err.into_response(),
    };

    let Some(ws) = ws else {
        return (
            StatusCode::UPGRADE_REQUIRED,
            Json(json!({ "error": "websocket upgrade required" })),
        )
            .into_response();
    };

    let params = StreamParams::for_admission(
        &admission,
        StreamParams {
            url: query.url,
            entity: query.entity,
            server: query.server,
        },
    );
    let forwarded =
        ForwardedHeaders::from_request(&headers, connect_info.map(|ConnectInfo(addr)| addr));
    let cookie = HeaderValue::from_str(&format!(
        "{HLS_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax",
        state.hls_session
    ));

    let session_state = Arc::clone(&state);
    let mut response = ws.on_upgrade(move |socket| async move {
        let state = session_state;
        match proxy::resolve_backend(&params, &state.backend, state.sources.as_ref()) {
            Ok(target) => proxy::open_session(socket, target, forwarded).await,
            Err(err) => {
                warn!(error = %err, "stream request could not be resolved");
                proxy::reject(socket, &err).await;
            }
        }
    });
    if let Ok(cookie) = cookie {
        response.headers_mut().insert(SET_COOKIE, cookie);
    }
    response
}

fn admit(
    state: &AppState,
    query: &WsQuery,
    headers: &HeaderMap,
    path: &str,
) -> Result<Admission, LensError> {
    let request = GateRequest {
        embed: query.embed.as_deref(),
        link_id: query.url.as_deref(),
        signature: query.auth_sig.as_deref(),
        path,
    };
    state.gate.admit(request, headers).inspect_err(|err| {
        counter!("beach_lens_requests_rejected_total", 1, "reason" => err.metric_label());
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct SignatureQuery {
    #[serde(rename = "authSig")]
    pub auth_sig: Option<String>,
}

/// One-shot SDP exchange for clients that cannot hold a WebSocket.
#[derive(Debug, Default, Deserialize)]
pub struct StreamRequest {
    pub url: Option<String>,
    pub entity: Option<String>,
    pub server: Option<String>,
    /// Base64 encoded SDP offer.
    pub sdp64: Option<String>,
    pub link_id: Option<String>,
}

pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    uri: Uri,
    Query(signature): Query<SignatureQuery>,
    Json(request): Json<StreamRequest>,
) -> Result<Json<Value>, LensError> {
    // Validate the body first so a bad request never spends a link.
    let sdp = decode_sdp(request.sdp64.as_deref())?;
    let gate_request = GateRequest {
        embed: request.link_id.as_ref().map(|_| "1"),
        link_id: request.link_id.as_deref(),
        signature: signature.auth_sig.as_deref(),
        path: uri.path(),
    };
    let admission = state.gate.admit(gate_request, &headers)?;

    let params = StreamParams::for_admission(
        &admission,
        StreamParams {
            url: request.url,
            entity: request.entity,
            server: request.server,
        },
    );
    let target = proxy::resolve_backend(&params, &state.backend, state.sources.as_ref())?;
    let forwarded =
        ForwardedHeaders::from_request(&headers, connect_info.map(|ConnectInfo(addr)| addr));

    let answer = proxy::exchange_offer(&target, &forwarded, &sdp).await?;
    info!(gateway_url = %target, "sdp offer answered");
    Ok(Json(answer))
}

fn decode_sdp(sdp64: Option<&str>) -> Result<String, LensError> {
    let encoded = sdp64
        .map(str::trim)
        .filter(|sdp| !sdp.is_empty())
        .ok_or_else(|| LensError::InvalidRequest("missing `sdp64`".into()))?;
    let raw = STANDARD
        .decode(encoded)
        .map_err(|err| LensError::InvalidRequest(format!("invalid `sdp64`: {err}")))?;
    String::from_utf8(raw).map_err(|_| LensError::InvalidRequest("`sdp64` is not UTF-8".into()))
}
