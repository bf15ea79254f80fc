use std::sync::Arc;

use beach_lens_core::{LinkStore, PathSigner};
use metrics_exporter_prometheus::PrometheusHandle;
use rand::RngCore;
use url::Url;

use crate::{
    backend::Backend,
    cast::{CastDispatcher, WebhookCaster},
    gate::RequestGate,
    sources::{SourceResolver, StaticSources},
};

/// Name of the cookie that unlocks HLS segments.
pub const HLS_COOKIE: &str = "beach_lens_hls";

const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:8123";

pub struct AppState {
    pub namespace: String,
    pub backend: Backend,
    pub gate: RequestGate,
    pub sources: Arc<dyn SourceResolver>,
    pub caster: Arc<dyn CastDispatcher>,
    pub http: reqwest::Client,
    /// Random per-process value handed out with stream upgrades.
    pub hls_session: String,
    /// Externally reachable base, without a trailing slash.
    pub public_url: String,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn builder(namespace: impl Into<String>, backend: Backend) -> AppStateBuilder {
        AppStateBuilder {
            namespace: namespace.into(),
            backend,
            links: LinkStore::new(),
            signing_secret: random_hex(32).into_bytes(),
            access_tokens: Vec::new(),
            sources: None,
            caster: None,
            http: None,
            public_url: DEFAULT_PUBLIC_URL.to_string(),
            metrics: None,
        }
    }

    pub fn links(&self) -> &LinkStore {
        self.gate.links()
    }

    pub fn api_path(&self, rest: &str) -> String {
        format!("/api/{}/{}", self.namespace, rest)
    }

    /// Page a cast device opens to play link `link_id`.
    pub fn embed_url(&self, link_id: &str) -> String {
        format!("{}/{}/embed?url={}", self.public_url, self.namespace, link_id)
    }
}

pub struct AppStateBuilder {
    namespace: String,
    backend: Backend,
    links: LinkStore,
    signing_secret: Vec<u8>,
    access_tokens: Vec<String>,
    sources: Option<Arc<dyn SourceResolver>>,
    caster: Option<Arc<dyn CastDispatcher>>,
    http: Option<reqwest::Client>,
    public_url: String,
    metrics: Option<PrometheusHandle>,
}

impl AppStateBuilder {
    pub fn links(mut self, links: LinkStore) -> Self {
        self.links = links;
        self
    }

    pub fn signing_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.signing_secret = secret.into();
        self
    }

    pub fn access_tokens(mut self, tokens: Vec<String>) -> Self {
        self.access_tokens = tokens;
        self
    }

    pub fn sources(mut self, sources: Arc<dyn SourceResolver>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn caster(mut self, caster: Arc<dyn CastDispatcher>) -> Self {
        self.caster = Some(caster);
        self
    }

    pub fn http(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn public_url(mut self, url: Url) -> Self {
        self.public_url = url.as_str().trim_end_matches('/').to_string();
        self
    }

    pub fn metrics(mut self, metrics: PrometheusHandle) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> AppState {
        let http = self.http.unwrap_or_default();
        let caster = self
            .caster
            .unwrap_or_else(|| Arc::new(WebhookCaster::new(http.clone(), None)) as Arc<dyn CastDispatcher>);
        AppState {
            namespace: self.namespace,
            gate: RequestGate::new(
                self.links,
                PathSigner::new(&self.signing_secret),
                self.access_tokens,
            ),
            backend: self.backend,
            sources: self
                .sources
                .unwrap_or_else(|| Arc::new(StaticSources::default()) as Arc<dyn SourceResolver>),
            caster,
            http,
            hls_session: random_hex(16),
            public_url: self.public_url,
            metrics: self.metrics,
        }
    }
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
