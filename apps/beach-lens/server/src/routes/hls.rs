use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{
        header::{CONTENT_TYPE, COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
};

use crate::{
    backend,
    error::LensError,
    state::{AppState, HLS_COOKIE},
};

/// Files the gateway serves for an HLS stream.
pub const HLS_FILES: [&str; 4] = ["playlist.m3u8", "init.mp4", "segment.m4s", "segment.ts"];

pub async fn hls_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, LensError> {
    if cookie_value(&headers, HLS_COOKIE) != Some(state.hls_session.as_str()) {
        return Err(LensError::Unauthorized);
    }
    if !HLS_FILES.contains(&filename.as_str()) {
        return Err(LensError::NotFound(filename));
    }

    let base = state.backend.resolve_base_url()?;
    let mut url = backend::hls_url(&base, &filename)?;
    url.set_query(query.as_deref());

    let upstream = state
        .http
        .get(url)
        .send()
        .await
        .map_err(|err| LensError::Backend(err.to_string()))?;
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| HeaderValue::from_bytes(value.as_bytes()).ok());
    let body = upstream
        .bytes()
        .await
        .map_err(|err| LensError::Backend(err.to_string()))?;

    let mut response = (status, Body::from(body)).into_response();
    if let Some(content_type) = content_type {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    Ok(response)
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn finds_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.append(COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(
            COOKIE,
            HeaderValue::from_static("a=1; beach_lens_hls=feedface; b=2"),
        );
        assert_eq!(cookie_value(&headers, HLS_COOKIE), Some("feedface"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
