use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use beach_lens_core::{LinkError, SignatureError};
use serde_json::{json, Value};
use thiserror::Error;

/// Every failure a request can end in. Handlers map it to a status code
/// before a WebSocket upgrade and to an in-band error frame after it.
#[derive(Debug, Error)]
pub enum LensError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} has expired")]
    Gone(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("Missing `url` or `entity`")]
    MissingSource,
    #[error("Can't get URL for {0}")]
    SourceUnavailable(String),
    #[error("streaming gateway is not available")]
    BackendUnavailable,
    #[error("streaming gateway could not be started")]
    ProcessFatal,
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("gateway error: {0}")]
    Backend(String),
    #[error("client connection error: {0}")]
    Client(String),
}

impl LensError {
    pub fn status(&self) -> StatusCode {
        match self {
            LensError::NotFound(_) => StatusCode::NOT_FOUND,
            LensError::Gone(_) => StatusCode::GONE,
            LensError::Unauthorized => StatusCode::UNAUTHORIZED,
            LensError::MissingSource
            | LensError::SourceUnavailable(_)
            | LensError::InvalidUrl(_)
            | LensError::InvalidRequest(_)
            | LensError::Client(_) => StatusCode::BAD_REQUEST,
            LensError::Backend(_) => StatusCode::BAD_GATEWAY,
            LensError::BackendUnavailable | LensError::ProcessFatal => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            LensError::NotFound(_) => "not_found",
            LensError::Gone(_) => "gone",
            LensError::Unauthorized => "unauthorized",
            LensError::MissingSource => "missing_source",
            LensError::SourceUnavailable(_) => "source_unavailable",
            LensError::BackendUnavailable => "backend_unavailable",
            LensError::ProcessFatal => "process_fatal",
            LensError::InvalidUrl(_) => "invalid_url",
            LensError::InvalidRequest(_) => "invalid_request",
            LensError::Backend(_) => "backend",
            LensError::Client(_) => "client",
        }
    }

    /// The single frame sent to a WebSocket client before its session ends.
    pub fn error_frame(&self) -> Value {
        json!({ "type": "error", "value": self.to_string() })
    }
}

impl From<LinkError> for LensError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::NotFound(id) => LensError::NotFound(format!("link {id}")),
            LinkError::Gone(id) => LensError::Gone(format!("link {id}")),
        }
    }
}

impl From<SignatureError> for LensError {
    fn from(_: SignatureError) -> Self {
        LensError::Unauthorized
    }
}

impl IntoResponse for LensError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn link_errors_map_to_404_and_410() {
        let not_found = LensError::from(LinkError::NotFound("x".into()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        let gone = LensError::from(LinkError::Gone("x".into()));
        assert_eq!(gone.status(), StatusCode::GONE);
        assert_eq!(
            LensError::from(SignatureError::Missing).status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test_timeout::timeout]
    fn error_frame_shape() {
        let frame = LensError::SourceUnavailable("camera.back".into()).error_frame();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["value"], "Can't get URL for camera.back");
        assert_eq!(
            LensError::MissingSource.error_frame()["value"],
            "Missing `url` or `entity`"
        );
    }
}
