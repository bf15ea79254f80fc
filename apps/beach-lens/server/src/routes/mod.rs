mod auth;
mod hls;
mod services;
mod stream;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub use auth::SessionAuth;
pub use hls::HLS_FILES;
pub use services::{CastStarted, LinkCreated, SignedPath};

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = |rest: &str| state.api_path(rest);
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(&api("ws"), get(stream::ws_handler))
        .route(&api("stream"), post(stream::stream_handler))
        .route(&api("hls/:filename"), get(hls::hls_handler))
        .route(&api("services/create_link"), post(services::create_link))
        .route(&api("services/dash_cast"), post(services::dash_cast))
        .route(&api("services/sign_path"), post(services::sign_path))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "gateway_available": state.backend.available(),
        "gateway_port": state.backend.port(),
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::Backend,
        cast::{CastDispatcher, CastRequest},
        sources::StaticSources,
    };
    use async_trait::async_trait;
    use axum::{
        body::{self, Body},
        http::{HeaderValue, Request},
        response::Response,
    };
    use beach_lens_core::{LinkStore, LinkTarget, SIGN_QUERY_PARAM};
    use std::sync::Mutex;
    use tower::util::ServiceExt;
    use url::Url;

    const TOKEN: &str = "test-token";

    #[derive(Default)]
    struct RecordingCaster {
        requests: Mutex<Vec<CastRequest>>,
    }

    #[async_trait]
    impl CastDispatcher for RecordingCaster {
        async fn cast(&self, request: CastRequest) {
            self.requests.lock().unwrap().push(request);
        }
    }

    struct Harness {
        app: Router,
        state: Arc<AppState>,
        caster: Arc<RecordingCaster>,
    }

    fn harness() -> Harness {
        let caster = Arc::new(RecordingCaster::default());
        let sources = StaticSources::default().with_camera("camera.front", "rtsp://10.0.0.5/main");
        let state = Arc::new(
            AppState::builder(
                "webrtc",
                Backend::External(Url::parse("http://127.0.0.1:1/").unwrap()),
            )
            .links(LinkStore::new())
            .signing_secret(b"router-test-secret".to_vec())
            .access_tokens(vec![TOKEN.into()])
            .sources(Arc::new(sources))
            .caster(caster.clone())
            .public_url(Url::parse("https://home.example/").unwrap())
            .build(),
        );
        Harness {
            app: build_router(state.clone()),
            state,
            caster,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test_timeout::timeout(10)]
    async fn ws_without_credentials_is_unauthorized() {
        let h = harness();
        let response = send(&h.app, get("/api/webrtc/ws?entity=camera.front")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test_timeout::timeout(10)]
    async fn ws_embed_statuses_follow_link_state() {
        let h = harness();
        let response = send(&h.app, get("/api/webrtc/ws?embed=1&url=unknown")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        h.state.links().create_at(
            "stale",
            LinkTarget::Entity("camera.front".into()),
            1,
            60,
            time::OffsetDateTime::now_utc() - time::Duration::minutes(5),
        );
        let response = send(&h.app, get("/api/webrtc/ws?embed=1&url=stale")).await;
        assert_eq!(response.status(), StatusCode::GONE);
        assert!(h.state.links().peek("stale").is_none());
    }

    #[test_timeout::timeout(10)]
    async fn admitted_request_without_upgrade_gets_426_and_uses_the_link() {
        let h = harness();
        h.state
            .links()
            .create("abc123", LinkTarget::Entity("camera.front".into()), 1, 60);

        let response = send(&h.app, get("/api/webrtc/ws?embed=1&url=abc123")).await;
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        let response = send(&h.app, get("/api/webrtc/ws?embed=1&url=abc123")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test_timeout::timeout(10)]
    async fn signed_ws_path_is_admitted_and_bound_to_the_path() {
        let h = harness();
        let signer = h.state.gate.signer();
        let token = signer
            .sign("/api/webrtc/ws", time::Duration::minutes(1))
            .unwrap();

        let uri = format!("/api/webrtc/ws?entity=camera.front&{SIGN_QUERY_PARAM}={token}");
        assert_eq!(
            send(&h.app, get(&uri)).await.status(),
            StatusCode::UPGRADE_REQUIRED
        );

        let mut tampered = token.clone();
        tampered.replace_range(tampered.len() - 2.., "xx");
        let uri = format!("/api/webrtc/ws?entity=camera.front&{SIGN_QUERY_PARAM}={tampered}");
        assert_eq!(
            send(&h.app, get(&uri)).await.status(),
            StatusCode::UNAUTHORIZED
        );

        let other = signer
            .sign("/api/webrtc/stream", time::Duration::minutes(1))
            .unwrap();
        let uri = format!("/api/webrtc/ws?entity=camera.front&{SIGN_QUERY_PARAM}={other}");
        assert_eq!(
            send(&h.app, get(&uri)).await.status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test_timeout::timeout(10)]
    async fn create_link_requires_session_and_applies_defaults() {
        let h = harness();
        let body = json!({ "link_id": "front", "entity": "camera.front" });

        let response = send(&h.app, post_json("/api/webrtc/services/create_link", body.clone(), None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = send(&h.app, post_json("/api/webrtc/services/create_link", body, Some(TOKEN))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["link_id"], "front");

        let entry = h.state.links().peek("front").expect("link stored");
        assert_eq!(entry.target, LinkTarget::Entity("camera.front".into()));
        assert_eq!(entry.remaining_uses, Some(1));
        assert!(entry.expires_at.is_some());
    }

    #[test_timeout::timeout(10)]
    async fn create_link_validates_target() {
        let h = harness();
        let both = json!({ "link_id": "x", "url": "rtsp://a/1", "entity": "camera.front" });
        let response = send(&h.app, post_json("/api/webrtc/services/create_link", both, Some(TOKEN))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let neither = json!({ "link_id": "x" });
        let response = send(&h.app, post_json("/api/webrtc/services/create_link", neither, Some(TOKEN))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Missing `url` or `entity`");
        assert!(h.state.links().is_empty());
    }

    #[test_timeout::timeout(10)]
    async fn dash_cast_mints_single_use_link_and_casts_embed_page() {
        let h = harness();
        let body = json!({
            "entity_id": "media_player.kitchen",
            "entity": "camera.front",
            "force": true
        });
        let response = send(&h.app, post_json("/api/webrtc/services/dash_cast", body, Some(TOKEN))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let started: CastStarted = serde_json::from_value(json_body(response).await).unwrap();

        assert_eq!(
            started.url,
            format!("https://home.example/webrtc/embed?url={}", started.link_id)
        );
        let entry = h.state.links().peek(&started.link_id).expect("link");
        assert_eq!(entry.remaining_uses, Some(1));

        let requests = h.caster.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].entities, vec!["media_player.kitchen".to_string()]);
        assert_eq!(requests[0].url, started.url);
        assert!(requests[0].force);
    }

    #[test_timeout::timeout(10)]
    async fn sign_path_returns_a_usable_url() {
        let h = harness();
        let body = json!({ "path": "/api/webrtc/ws" });
        let response = send(&h.app, post_json("/api/webrtc/services/sign_path", body, Some(TOKEN))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let signed: SignedPath = serde_json::from_value(json_body(response).await).unwrap();
        assert!(signed.url.starts_with("/api/webrtc/ws?authSig="));

        let uri = format!("{}&entity=camera.front", signed.url);
        assert_eq!(
            send(&h.app, get(&uri)).await.status(),
            StatusCode::UPGRADE_REQUIRED
        );
    }

    #[test_timeout::timeout(10)]
    async fn hls_requires_cookie_and_known_file() {
        let h = harness();
        let response = send(&h.app, get("/api/webrtc/hls/playlist.m3u8")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let cookie = format!("beach_lens_hls={}", h.state.hls_session);
        let request = Request::builder()
            .uri("/api/webrtc/hls/secrets.txt")
            .header("cookie", HeaderValue::from_str(&cookie).unwrap())
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.app, request).await.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .uri("/api/webrtc/hls/playlist.m3u8")
            .header("cookie", "beach_lens_hls=wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&h.app, request).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[test_timeout::timeout(10)]
    async fn stream_post_reports_unreachable_gateway() {
        let h = harness();
        let body = json!({ "entity": "camera.front", "sdp64": "djA9MA==" });
        let response = send(&h.app, post_json("/api/webrtc/stream", body, Some(TOKEN))).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(json_body(response).await["error"].is_string());

        let missing_sdp = json!({ "entity": "camera.front" });
        let response = send(&h.app, post_json("/api/webrtc/stream", missing_sdp, Some(TOKEN))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test_timeout::timeout(10)]
    async fn malformed_stream_post_keeps_the_link() {
        let h = harness();
        h.state
            .links()
            .create("kitchen", LinkTarget::Entity("camera.front".into()), 1, 60);

        let missing_sdp = json!({ "link_id": "kitchen" });
        let response = send(&h.app, post_json("/api/webrtc/stream", missing_sdp, None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let garbled = json!({ "link_id": "kitchen", "sdp64": "%%not-base64%%" });
        let response = send(&h.app, post_json("/api/webrtc/stream", garbled, None)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let entry = h.state.links().peek("kitchen").expect("link still stored");
        assert_eq!(entry.remaining_uses, Some(1));
    }

    #[test_timeout::timeout(10)]
    async fn healthz_reports_gateway() {
        let h = harness();
        let response = send(&h.app, get("/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["gateway_available"], true);
        assert_eq!(body["gateway_port"], 1);
    }
}
