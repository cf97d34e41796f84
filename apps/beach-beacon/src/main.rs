use anyhow::Result;
use beach_beacon::config::{Cli, ServerConfig};
use beach_beacon::server;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        page = %config.page.display(),
        ice_servers = ?config.engine.ice_servers,
        "starting beach-beacon"
    );

    server::run(config).await
}
