use std::sync::Arc;

use axum::{extract::State, Json};
use beach_lens_core::{LinkTarget, SIGN_QUERY_PARAM};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::SessionAuth;
use crate::{cast::CastRequest, error::LensError, state::AppState};

const DEFAULT_SIGNATURE_TTL_SECS: i64 = 300;

fn default_open_limit() -> u32 {
    1
}

fn default_time_to_live() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub link_id: String,
    pub url: Option<String>,
    pub entity: Option<String>,
    #[serde(default = "default_open_limit")]
    pub open_limit: u32,
    #[serde(default = "default_time_to_live")]
    pub time_to_live: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkCreated {
    pub link_id: String,
}

pub async fn create_link(
    State(state): State<Arc<AppState>>,
    _auth: SessionAuth,
    Json(request): Json<CreateLinkRequest>,
) -> Result<Json<LinkCreated>, LensError> {
    let link_id = request.link_id.trim();
    if link_id.is_empty() {
        return Err(LensError::InvalidRequest("`link_id` is required".into()));
    }
    let target = link_target(request.url, request.entity)?;

    state
        .links()
        .create(link_id, target, request.open_limit, request.time_to_live);
    counter!("beach_lens_links_created_total", 1, "kind" => "service");
    info!(
        link_id,
        open_limit = request.open_limit,
        time_to_live = request.time_to_live,
        "link created"
    );

    Ok(Json(LinkCreated {
        link_id: link_id.to_string(),
    }))
}

/// One entity id or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum EntityIds {
    One(String),
    Many(Vec<String>),
}

impl EntityIds {
    fn into_vec(self) -> Vec<String> {
        match self {
            EntityIds::One(id) => vec![id],
            EntityIds::Many(ids) => ids,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DashCastRequest {
    pub entity_id: EntityIds,
    pub url: Option<String>,
    pub entity: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CastStarted {
    pub link_id: String,
    pub url: String,
}

pub async fn dash_cast(
    State(state): State<Arc<AppState>>,
    _auth: SessionAuth,
    Json(request): Json<DashCastRequest>,
) -> Result<Json<CastStarted>, LensError> {
    let entities: Vec<String> = request
        .entity_id
        .into_vec()
        .into_iter()
        .filter(|id| !id.trim().is_empty())
        .collect();
    if entities.is_empty() {
        return Err(LensError::InvalidRequest("`entity_id` is required".into()));
    }
    let target = link_target(request.url, request.entity)?;

    let link_id = state.links().create_ephemeral(target);
    let url = state.embed_url(&link_id);
    counter!("beach_lens_links_created_total", 1, "kind" => "cast");
    info!(link_id = %link_id, entities = ?entities, "casting embed page");

    state
        .caster
        .cast(CastRequest {
            entities,
            url: url.clone(),
            force: request.force,
        })
        .await;

    Ok(Json(CastStarted { link_id, url }))
}

#[derive(Debug, Deserialize)]
pub struct SignPathRequest {
    pub path: String,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedPath {
    pub path: String,
    pub signature: String,
    /// `path` with the signature appended as a query parameter.
    pub url: String,
}

pub async fn sign_path(
    State(state): State<Arc<AppState>>,
    _auth: SessionAuth,
    Json(request): Json<SignPathRequest>,
) -> Result<Json<SignedPath>, LensError> {
    if !request.path.starts_with('/') || request.path.contains('?') {
        return Err(LensError::InvalidRequest(
            "`path` must be an absolute path without a query".into(),
        ));
    }
    let ttl = request
        .ttl_seconds
        .filter(|ttl| *ttl > 0)
        .unwrap_or(DEFAULT_SIGNATURE_TTL_SECS);
    let signature = state
        .gate
        .signer()
        .sign(&request.path, time::Duration::seconds(ttl))
        .map_err(|err| LensError::InvalidRequest(err.to_string()))?;
    let url = format!("{}?{SIGN_QUERY_PARAM}={signature}", request.path);

    Ok(Json(SignedPath {
        path: request.path,
        signature,
        url,
    }))
}

fn link_target(url: Option<String>, entity: Option<String>) -> Result<LinkTarget, LensError> {
    let url = url.filter(|url| !url.trim().is_empty());
    let entity = entity.filter(|entity| !entity.trim().is_empty());
    match (url, entity) {
        (Some(_), Some(_)) => Err(LensError::InvalidRequest(
            "`url` and `entity` are mutually exclusive".into(),
        )),
        (Some(url), None) => Ok(LinkTarget::Url(url)),
        (None, Some(entity)) => Ok(LinkTarget::Entity(entity)),
        (None, None) => Err(LensError::MissingSource),
    }
}
