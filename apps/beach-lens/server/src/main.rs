use anyhow::Result;
use beach_lens_server::{
    config::{Cli, GatewaySetting, ServerConfig},
    run,
    telemetry::Telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    let gateway = match &config.gateway {
        GatewaySetting::Managed(options) => format!("managed:{}", options.program.display()),
        GatewaySetting::External(url) => format!("external:{url}"),
        GatewaySetting::Probe(url) => format!("probe:{url}"),
    };
    info!(
        listen_addr = %config.listen_addr,
        namespace = %config.namespace,
        gateway = %gateway,
        "starting beach-lens server"
    );

    run(config, telemetry.metrics_handle()).await
}
