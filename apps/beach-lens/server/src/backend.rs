use std::{sync::Arc, time::Duration};

use tracing::{debug, info};
use url::Url;

use crate::{
    config::GatewaySetting,
    error::LensError,
    supervisor::ProcessSupervisor,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Where streaming requests are sent.
#[derive(Clone)]
pub enum Backend {
    /// A gateway this process launched and supervises.
    Managed(Arc<ProcessSupervisor>),
    /// A gateway someone else runs.
    External(Url),
}

impl Backend {
    pub fn resolve_base_url(&self) -> Result<Url, LensError> {
        match self {
            Backend::External(url) => Ok(url.clone()),
            Backend::Managed(supervisor) => {
                // A fatal supervisor is reported once in its own log; requests
                // just see an unavailable gateway.
                if !supervisor.available() {
                    return Err(LensError::BackendUnavailable);
                }
                managed_base_url(supervisor.port())
            }
        }
    }

    pub fn available(&self) -> bool {
        match self {
            Backend::External(_) => true,
            Backend::Managed(supervisor) => supervisor.available(),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Backend::External(url) => url.port_or_known_default(),
            Backend::Managed(supervisor) => Some(supervisor.port()),
        }
    }

    pub async fn stop(&self) {
        if let Backend::Managed(supervisor) = self {
            supervisor.stop().await;
        }
    }
}

fn managed_base_url(port: u16) -> Result<Url, LensError> {
    let raw = format!("http://127.0.0.1:{port}/");
    Url::parse(&raw).map_err(|_| LensError::InvalidUrl(raw))
}

/// Picks the backend for this process. An explicit URL always wins; with
/// no binary configured a local gateway that answers the probe is reused.
pub async fn select_backend(
    setting: GatewaySetting,
    http: &reqwest::Client,
) -> anyhow::Result<Backend> {
    match setting {
        GatewaySetting::External(url) => {
            info!(url = %url, "using external gateway");
            Ok(Backend::External(url))
        }
        GatewaySetting::Probe(url) => {
            if probe_gateway(http, &url).await {
                info!(url = %url, "found running gateway");
            } else {
                info!(url = %url, "no gateway answered the probe; requests will fail until it is up");
            }
            Ok(Backend::External(url))
        }
        GatewaySetting::Managed(options) => {
            info!(
                program = %options.program.display(),
                base_port = options.base_port,
                "launching managed gateway"
            );
            let supervisor = ProcessSupervisor::start(options)?;
            Ok(Backend::Managed(Arc::new(supervisor)))
        }
    }
}

/// HEAD request answered with a status below 300 within two seconds.
pub async fn probe_gateway(http: &reqwest::Client, url: &Url) -> bool {
    let request = http.head(url.clone()).timeout(PROBE_TIMEOUT).send();
    match request.await {
        Ok(response) => response.status().as_u16() < 300,
        Err(err) => {
            debug!(url = %url, error = %err, "gateway probe failed");
            false
        }
    }
}

/// `http(s)://host/` becomes `ws(s)://host/api/ws?src=<source>`.
pub fn ws_url(base: &Url, source: &str) -> Result<Url, LensError> {
    let mut url = base
        .join("api/ws")
        .map_err(|_| LensError::InvalidUrl(base.to_string()))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| LensError::InvalidUrl(base.to_string()))?;
    url.query_pairs_mut().clear().append_pair("src", source);
    Ok(url)
}

pub fn hls_url(base: &Url, filename: &str) -> Result<Url, LensError> {
    base.join("api/hls/")
        .and_then(|hls| hls.join(filename))
        .map_err(|_| LensError::InvalidUrl(base.to_string()))
}

/// Same as [`ws_url`] but for a user supplied `server` override, which may
/// omit the trailing slash.
pub fn parse_server_override(server: &str) -> Result<Url, LensError> {
    let mut url = Url::parse(server).map_err(|_| LensError::InvalidUrl(server.to_string()))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn ws_url_switches_scheme_and_encodes_source() {
        let base = Url::parse("http://127.0.0.1:1984/").unwrap();
        let url = ws_url(&base, "rtsp://cam/stream?a=1&b=2").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/api/ws");
        let src: Vec<_> = url.query_pairs().collect();
        assert_eq!(src.len(), 1);
        assert_eq!(src[0].0, "src");
        assert_eq!(src[0].1, "rtsp://cam/stream?a=1&b=2");

        let secure = ws_url(&Url::parse("https://gw.example/go2rtc/").unwrap(), "cam").unwrap();
        assert_eq!(secure.as_str(), "wss://gw.example/go2rtc/api/ws?src=cam");
    }

    #[test_timeout::timeout]
    fn hls_url_stays_under_base() {
        let base = Url::parse("http://127.0.0.1:1984/").unwrap();
        assert_eq!(
            hls_url(&base, "playlist.m3u8").unwrap().as_str(),
            "http://127.0.0.1:1984/api/hls/playlist.m3u8"
        );
    }

    #[test_timeout::timeout]
    fn server_override_gets_trailing_slash() {
        let url = parse_server_override("http://192.168.1.5:1984/sub").unwrap();
        assert_eq!(url.as_str(), "http://192.168.1.5:1984/sub/");
        assert!(matches!(
            parse_server_override("not a url"),
            Err(LensError::InvalidUrl(_))
        ));
    }

    #[test_timeout::timeout]
    fn external_backend_is_always_available() {
        let backend = Backend::External(Url::parse("http://gw:1984/").unwrap());
        assert!(backend.available());
        assert_eq!(backend.port(), Some(1984));
        assert_eq!(
            backend.resolve_base_url().unwrap().as_str(),
            "http://gw:1984/"
        );
    }

    #[test_timeout::timeout(10)]
    async fn fatal_gateway_fails_fast_as_unavailable() {
        let supervisor = ProcessSupervisor::start(crate::config::GatewayOptions::new(
            "/nonexistent/beach-lens-gateway",
        ))
        .unwrap();
        while !supervisor.is_fatal() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let backend = Backend::Managed(Arc::new(supervisor));

        assert!(!backend.available());
        for _ in 0..2 {
            assert!(matches!(
                backend.resolve_base_url(),
                Err(LensError::BackendUnavailable)
            ));
        }
        backend.stop().await;
    }

    #[test_timeout::timeout(10)]
    async fn probe_of_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        assert!(!probe_gateway(&reqwest::Client::new(), &url).await);
    }
}
