use std::{
    net::{AddrParseError, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;
use rand::RngCore;
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

pub const DEFAULT_GATEWAY_PORT: u16 = 1984;
/// Highest port the supervisor will try before giving up.
pub const PORT_CEILING: u16 = 10_000;
pub const DEFAULT_GATEWAY_PROBE_URL: &str = "http://localhost:1984/";
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {addr}: {source}")]
    ListenAddr {
        addr: String,
        #[source]
        source: AddrParseError,
    },
    #[error("invalid {field} url {value}: {source}")]
    Url {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("udp port range is invalid: min {min} is above max {max}")]
    UdpRange { min: u16, max: u16 },
    #[error("namespace must be a single non-empty path segment, got {0:?}")]
    Namespace(String),
    #[error("gateway base port {port} is above the ceiling {ceiling}")]
    BasePort { port: u16, ceiling: u16 },
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-lens-server",
    author,
    version,
    about = "Camera stream gateway supervisor and WebSocket proxy"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_LENS_LISTEN_ADDR", default_value = "127.0.0.1:8123")]
    pub listen_addr: String,

    /// Path segment the API is mounted under (`/api/<namespace>/...`).
    #[arg(long, env = "BEACH_LENS_NAMESPACE", default_value = "webrtc")]
    pub namespace: String,

    /// Gateway executable. When set, the gateway is launched and supervised.
    #[arg(long, env = "BEACH_LENS_GATEWAY_BINARY")]
    pub gateway_binary: Option<PathBuf>,

    /// Extra arguments passed to the gateway before the inline config.
    #[arg(long = "gateway-arg", env = "BEACH_LENS_GATEWAY_ARGS", value_delimiter = ' ')]
    pub gateway_args: Vec<String>,

    /// Already-running gateway to use instead of launching one.
    #[arg(long, env = "BEACH_LENS_GATEWAY_URL")]
    pub gateway_url: Option<String>,

    /// First port tried by a managed gateway.
    #[arg(long, env = "BEACH_LENS_GATEWAY_PORT", default_value_t = DEFAULT_GATEWAY_PORT)]
    pub gateway_port: u16,

    #[arg(long, env = "BEACH_LENS_UDP_MIN", default_value_t = 0)]
    pub udp_min: u16,

    #[arg(long, env = "BEACH_LENS_UDP_MAX", default_value_t = 0)]
    pub udp_max: u16,

    /// ICE/STUN servers handed to the gateway.
    #[arg(
        long,
        env = "BEACH_LENS_ICE_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_ICE_SERVER
    )]
    pub ice_servers: Vec<String>,

    /// Secret for signed path tokens. A random one is generated when unset.
    #[arg(long, env = "BEACH_LENS_SIGNING_SECRET", hide_env_values = true)]
    pub signing_secret: Option<String>,

    /// Bearer tokens accepted as an authenticated session.
    #[arg(
        long,
        env = "BEACH_LENS_ACCESS_TOKENS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub access_tokens: Vec<String>,

    /// JSON file with camera sources and template variables.
    #[arg(long, env = "BEACH_LENS_SOURCES_FILE")]
    pub sources_file: Option<PathBuf>,

    /// Externally reachable base URL used in cast embed links.
    #[arg(long, env = "BEACH_LENS_PUBLIC_URL", default_value = "http://127.0.0.1:8123/")]
    pub public_url: String,

    /// Endpoint that receives cast requests.
    #[arg(long, env = "BEACH_LENS_CAST_WEBHOOK")]
    pub cast_webhook: Option<String>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_LENS_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

/// Inclusive UDP port bounds for WebRTC media. `0/0` leaves the choice to
/// the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpPortRange {
    pub min: u16,
    pub max: u16,
}

impl UdpPortRange {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max != 0 && self.min > self.max {
            return Err(ConfigError::UdpRange {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.min != 0 || self.max != 0
    }
}

/// How to launch a managed gateway.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub base_port: u16,
    pub port_ceiling: u16,
    pub ice_servers: Vec<String>,
    pub udp: UdpPortRange,
}

impl GatewayOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            base_port: DEFAULT_GATEWAY_PORT,
            port_ceiling: PORT_CEILING,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            udp: UdpPortRange::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.udp.validate()?;
        if self.base_port > self.port_ceiling {
            return Err(ConfigError::BasePort {
                port: self.base_port,
                ceiling: self.port_ceiling,
            });
        }
        Ok(())
    }

    /// Inline gateway config for an attempt on `port`.
    pub fn gateway_config(&self, port: u16) -> Value {
        let ice_servers: Vec<Value> = self
            .ice_servers
            .iter()
            .map(|server| json!({ "urls": [server] }))
            .collect();
        let mut webrtc = json!({ "ice_servers": ice_servers });
        if self.udp.is_set() {
            webrtc["udp_min"] = json!(self.udp.min);
            webrtc["udp_max"] = json!(self.udp.max);
        }
        json!({
            "api": { "listen": format!("127.0.0.1:{port}") },
            "webrtc": webrtc,
        })
    }

    pub fn command_args(&self, port: u16) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("-config".to_string());
        args.push(self.gateway_config(port).to_string());
        args
    }
}

#[derive(Debug, Clone)]
pub enum GatewaySetting {
    /// Launch and supervise this binary.
    Managed(GatewayOptions),
    /// Use this URL as-is.
    External(Url),
    /// Probe the default local gateway; fall back to nothing.
    Probe(Url),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub namespace: String,
    pub gateway: GatewaySetting,
    pub signing_secret: Vec<u8>,
    pub access_tokens: Vec<String>,
    pub sources_file: Option<PathBuf>,
    pub public_url: Url,
    pub cast_webhook: Option<Url>,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr =
            cli.listen_addr
                .parse()
                .map_err(|source| ConfigError::ListenAddr {
                    addr: cli.listen_addr.clone(),
                    source,
                })?;

        let namespace = cli.namespace.trim_matches('/').to_string();
        if namespace.is_empty() || namespace.contains('/') {
            return Err(ConfigError::Namespace(cli.namespace));
        }

        let udp = UdpPortRange {
            min: cli.udp_min,
            max: cli.udp_max,
        };
        udp.validate()?;

        let gateway = match (cli.gateway_url, cli.gateway_binary) {
            (Some(url), _) => GatewaySetting::External(parse_url("gateway", &url)?),
            (None, Some(program)) => {
                let options = GatewayOptions {
                    program,
                    args: cli.gateway_args,
                    base_port: cli.gateway_port,
                    port_ceiling: PORT_CEILING,
                    ice_servers: cli
                        .ice_servers
                        .into_iter()
                        .map(|server| server.trim().to_string())
                        .filter(|server| !server.is_empty())
                        .collect(),
                    udp,
                };
                options.validate()?;
                GatewaySetting::Managed(options)
            }
            (None, None) => GatewaySetting::Probe(parse_url("gateway", DEFAULT_GATEWAY_PROBE_URL)?),
        };

        let signing_secret = match cli.signing_secret.filter(|secret| !secret.is_empty()) {
            Some(secret) => secret.into_bytes(),
            None => {
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };

        let access_tokens = cli
            .access_tokens
            .into_iter()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .collect();

        let cast_webhook = cli
            .cast_webhook
            .filter(|hook| !hook.trim().is_empty())
            .map(|hook| parse_url("cast webhook", &hook))
            .transpose()?;

        Ok(ServerConfig {
            listen_addr,
            namespace,
            gateway,
            signing_secret,
            access_tokens,
            sources_file: cli.sources_file,
            public_url: parse_url("public", &cli.public_url)?,
            cast_webhook,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::Url {
        field,
        value: value.to_string(),
        source,
    })
}
