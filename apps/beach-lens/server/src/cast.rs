use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

/// Instruction for cast devices to open a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CastRequest {
    pub entities: Vec<String>,
    pub url: String,
    pub force: bool,
}

/// Hands embed pages to cast devices. Delivery is fire-and-forget.
#[async_trait]
pub trait CastDispatcher: Send + Sync {
    async fn cast(&self, request: CastRequest);
}

/// Posts cast requests as JSON to a webhook.
pub struct WebhookCaster {
    http: reqwest::Client,
    endpoint: Option<Url>,
}

impl WebhookCaster {
    pub fn new(http: reqwest::Client, endpoint: Option<Url>) -> Self {
        Self { http, endpoint }
    }
}

#[async_trait]
impl CastDispatcher for WebhookCaster {
    async fn cast(&self, request: CastRequest) {
        let Some(endpoint) = &self.endpoint else {
            info!(
                entities = ?request.entities,
                url = %request.url,
                "no cast webhook configured; skipping cast"
            );
            return;
        };

        match self.http.post(endpoint.clone()).json(&request).send().await {
            Ok(response) if response.status().is_success() => {
                info!(entities = ?request.entities, "cast dispatched");
            }
            Ok(response) => {
                warn!(
                    status = %response.status(),
                    entities = ?request.entities,
                    "cast webhook rejected request"
                );
            }
            Err(err) => {
                warn!(error = %err, entities = ?request.entities, "cast webhook unreachable");
            }
        }
    }
}
