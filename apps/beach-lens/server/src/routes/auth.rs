use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::{error::LensError, state::AppState};

/// Rejects the request unless it carries an accepted session bearer token.
#[derive(Clone, Copy, Debug)]
pub struct SessionAuth;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for SessionAuth {
    type Rejection = LensError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        state
            .gate
            .require_session(&parts.headers)
            .map(|()| SessionAuth)
    }
}
