//! Client <-> gateway WebSocket relay.

use std::{borrow::Cow, net::SocketAddr, time::Duration};

use axum::{
    extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket},
    http::HeaderMap,
};
use beach_lens_core::LinkTarget;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        protocol::{frame::coding::CloseCode, CloseFrame as BackendCloseFrame},
        Message as BackendMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    backend::{self, Backend},
    error::LensError,
    gate::Admission,
    sources::SourceResolver,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const OFFER_TIMEOUT: Duration = Duration::from_secs(15);

type BackendSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Stream selection carried by a request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StreamParams {
    pub url: Option<String>,
    pub entity: Option<String>,
    /// Alternate gateway base URL.
    pub server: Option<String>,
}

impl StreamParams {
    /// Params stored behind a link. Links never carry a server override.
    pub fn from_link(target: &LinkTarget) -> Self {
        match target {
            LinkTarget::Url(url) => Self {
                url: Some(url.clone()),
                ..Default::default()
            },
            LinkTarget::Entity(entity) => Self {
                entity: Some(entity.clone()),
                ..Default::default()
            },
        }
    }

    /// Link admissions use the link's target; everything else uses the
    /// request's own params.
    pub fn for_admission(admission: &Admission, request: StreamParams) -> Self {
        match admission {
            Admission::Link { target, .. } => Self::from_link(target),
            Admission::Session | Admission::Signed => request,
        }
    }
}

/// Entity first, then literal URL or template.
pub fn resolve_source(
    params: &StreamParams,
    sources: &dyn SourceResolver,
) -> Result<String, LensError> {
    let entity = params.entity.as_deref().filter(|entity| !entity.is_empty());
    if let Some(entity) = entity {
        return sources
            .stream_source(entity)
            .ok_or_else(|| LensError::SourceUnavailable(entity.to_string()));
    }

    let template = params
        .url
        .as_deref()
        .filter(|url| !url.is_empty())
        .ok_or(LensError::MissingSource)?;
    let rendered = sources
        .render(template)
        .map_err(|err| LensError::InvalidRequest(err.to_string()))?;
    match Url::parse(&rendered) {
        Ok(url) if !url.scheme().is_empty() => Ok(rendered),
        _ => Err(LensError::InvalidUrl(rendered)),
    }
}

/// Backend WebSocket URL for `params`.
pub fn resolve_backend(
    params: &StreamParams,
    backend: &Backend,
    sources: &dyn SourceResolver,
) -> Result<Url, LensError> {
    let source = resolve_source(params, sources)?;
    let base = match params.server.as_deref().filter(|server| !server.is_empty()) {
        Some(server) => backend::parse_server_override(server)?,
        None => backend.resolve_base_url()?,
    };
    backend::ws_url(&base, &source)
}

/// Client metadata passed on to the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedHeaders {
    pub forwarded_for: Option<String>,
    pub user_agent: Option<String>,
    pub host: Option<String>,
    pub proto: Option<String>,
}

impl ForwardedHeaders {
    pub fn from_request(headers: &HeaderMap, remote: Option<SocketAddr>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let forwarded_for = match (header("x-forwarded-for"), remote) {
            (Some(chain), Some(remote)) => Some(format!("{chain}, {}", remote.ip())),
            (Some(chain), None) => Some(chain),
            (None, Some(remote)) => Some(remote.ip().to_string()),
            (None, None) => None,
        };

        Self {
            forwarded_for,
            user_agent: header("user-agent"),
            host: header("x-forwarded-host").or_else(|| header("host")),
            proto: header("x-forwarded-proto").or_else(|| Some("http".to_string())),
        }
    }

    fn apply(&self, headers: &mut tokio_tungstenite::tungstenite::http::HeaderMap) {
        let pairs = [
            ("x-forwarded-for", &self.forwarded_for),
            ("user-agent", &self.user_agent),
            ("x-forwarded-host", &self.host),
            ("x-forwarded-proto", &self.proto),
        ];
        for (name, value) in pairs {
            let Some(value) = value else { continue };
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.insert(HeaderName::from_static(name), value);
                }
                Err(_) => debug!(header = name, "dropping unrepresentable forwarded header"),
            }
        }
    }
}

async fn dial(target: &Url, forwarded: &ForwardedHeaders) -> Result<BackendSocket, LensError> {
    let mut request = target
        .as_str()
        .into_client_request()
        .map_err(|err| LensError::Backend(err.to_string()))?;
    forwarded.apply(request.headers_mut());

    let (socket, _response) = tokio::time::timeout(DIAL_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| LensError::Backend(format!("timed out connecting to {target}")))?
        .map_err(|err| LensError::Backend(err.to_string()))?;
    Ok(socket)
}

/// Relays `client` to the gateway at `target` until either side is done.
/// Failures are reported to the client once and logged, never returned.
pub async fn open_session(client: WebSocket, target: Url, forwarded: ForwardedHeaders) {
    let backend = match dial(&target, &forwarded).await {
        Ok(backend) => backend,
        Err(err) => {
            warn!(gateway_url = %target, error = %err, "failed to reach gateway");
            reject(client, &err).await;
            return;
        }
    };

    counter!("beach_lens_sessions_opened_total", 1);
    info!(gateway_url = %target, client = ?forwarded.forwarded_for, "stream session opened");
    let outcome = relay(client, backend).await;

    match outcome {
        Ok(side) => info!(closed_by = side, "stream session closed"),
        Err(err) => warn!(error = %err, "stream session ended with error"),
    }
    counter!("beach_lens_sessions_closed_total", 1);
}

/// Sends the error frame and closes. Used for failures after the upgrade.
pub async fn reject(mut client: WebSocket, err: &LensError) {
    counter!("beach_lens_session_errors_total", 1, "reason" => err.metric_label());
    let frame = ClientMessage::Text(err.error_frame().to_string());
    if let Err(send_err) = client.send(frame).await {
        debug!(error = %send_err, "failed to deliver error frame");
    }
    let _ = client.close().await;
}

async fn relay(client: WebSocket, backend: BackendSocket) -> Result<&'static str, LensError> {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let outcome = {
        let upstream = async {
            while let Some(message) = client_rx.next().await {
                let message = message.map_err(client_error)?;
                let closing = matches!(message, ClientMessage::Close(_));
                if let Some(message) = to_backend(message) {
                    backend_tx
                        .send(message)
                        .await
                        .map_err(|err| LensError::Backend(err.to_string()))?;
                }
                if closing {
                    break;
                }
                counter!("beach_lens_frames_relayed_total", 1, "direction" => "upstream");
            }
            Ok::<_, LensError>("client")
        };
        let downstream = async {
            while let Some(message) = backend_rx.next().await {
                let message = message.map_err(|err| LensError::Backend(err.to_string()))?;
                let closing = matches!(message, BackendMessage::Close(_));
                if let Some(message) = to_client(message) {
                    client_tx.send(message).await.map_err(client_error)?;
                }
                if closing {
                    break;
                }
                counter!("beach_lens_frames_relayed_total", 1, "direction" => "downstream");
            }
            Ok::<_, LensError>("gateway")
        };
        tokio::select! {
            result = upstream => result,
            result = downstream => result,
        }
    };

    if let Err(err) = &outcome {
        let frame = ClientMessage::Text(err.error_frame().to_string());
        if let Err(send_err) = client_tx.send(frame).await {
            debug!(error = %send_err, "failed to deliver error frame");
        }
    }
    if let Err(err) = client_tx.close().await {
        debug!(error = %err, "client already closed");
    }
    if let Err(err) = backend_tx.close().await {
        debug!(error = %err, "gateway already closed");
    }
    outcome
}

fn client_error(err: axum::Error) -> LensError {
    LensError::Client(err.to_string())
}

// Ping and pong stay on their own hop: both sockets answer pings
// themselves, so relaying them would double every pong.
fn to_backend(message: ClientMessage) -> Option<BackendMessage> {
    Some(match message {
        ClientMessage::Text(text) => BackendMessage::Text(text.into()),
        ClientMessage::Binary(data) => BackendMessage::Binary(data.into()),
        ClientMessage::Ping(_) | ClientMessage::Pong(_) => return None,
        ClientMessage::Close(frame) => BackendMessage::Close(frame.map(|frame| BackendCloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason.into_owned().into(),
        })),
    })
}

fn to_client(message: BackendMessage) -> Option<ClientMessage> {
    Some(match message {
        BackendMessage::Text(text) => ClientMessage::Text(text.as_str().to_owned()),
        BackendMessage::Binary(data) => ClientMessage::Binary(data.to_vec()),
        BackendMessage::Ping(_) | BackendMessage::Pong(_) | BackendMessage::Frame(_) => {
            return None
        }
        BackendMessage::Close(frame) => ClientMessage::Close(frame.map(|frame| ClientCloseFrame {
            code: u16::from(frame.code),
            reason: Cow::Owned(frame.reason.as_str().to_owned()),
        })),
    })
}

/// Sends one SDP offer to the gateway and returns its first JSON reply.
pub async fn exchange_offer(
    target: &Url,
    forwarded: &ForwardedHeaders,
    sdp: &str,
) -> Result<Value, LensError> {
    let mut socket = dial(target, forwarded).await?;
    let offer = json!({ "type": "webrtc/offer", "value": sdp });
    socket
        .send(BackendMessage::Text(offer.to_string().into()))
        .await
        .map_err(|err| LensError::Backend(err.to_string()))?;

    let reply = tokio::time::timeout(OFFER_TIMEOUT, async {
        while let Some(message) = socket.next().await {
            match message.map_err(|err| LensError::Backend(err.to_string()))? {
                BackendMessage::Text(text) => {
                    return serde_json::from_str::<Value>(text.as_str())
                        .map_err(|err| LensError::Backend(err.to_string()));
                }
                BackendMessage::Close(_) => break,
                _ => continue,
            }
        }
        Err(LensError::Backend("gateway closed before answering".into()))
    })
    .await
    .map_err(|_| LensError::Backend("timed out waiting for the gateway answer".into()))?;

    if let Err(err) = socket.close(None).await {
        debug!(error = %err, "failed to close offer socket");
    }
    reply
}
