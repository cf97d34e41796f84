use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::engine::webrtc::WebRtcEngineConfig;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Parser)]
#[command(
    name = "beach-beacon",
    author,
    version,
    about = "WebRTC signaling server that streams to browsers using perfect negotiation"
)]
pub struct Cli {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "BEACH_BEACON_LISTEN_ADDR", default_value = "0.0.0.0:57778")]
    pub listen_addr: String,

    /// STUN server used for candidate gathering. Repeat or comma separate for several.
    #[arg(
        long = "stun-server",
        env = "BEACH_BEACON_STUN_SERVERS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_SERVER
    )]
    pub stun_servers: Vec<String>,

    /// Only gather host candidates; no STUN servers are contacted.
    #[arg(long, env = "BEACH_BEACON_LOCALHOST_ONLY", default_value_t = false)]
    pub localhost_only: bool,

    /// HTML page served on `/` and `/index.html`.
    #[arg(long, env = "BEACH_BEACON_PAGE", default_value = "static/index.html")]
    pub page: PathBuf,

    /// Text sent back for every string message received on a data channel.
    #[arg(long, env = "BEACH_BEACON_DATA_CHANNEL_REPLY")]
    pub data_channel_reply: Option<String>,

    /// Grace period for closing sessions during shutdown.
    #[arg(long, env = "BEACH_BEACON_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub page: PathBuf,
    pub engine: WebRtcEngineConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let ice_servers = if cli.localhost_only {
            Vec::new()
        } else {
            cli.stun_servers
                .iter()
                .map(|server| normalize_stun_url(server))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(ServerConfig {
            listen_addr,
            page: cli.page,
            engine: WebRtcEngineConfig {
                ice_servers,
                data_channel_reply: cli.data_channel_reply,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

/// Accepts `host:port` as shorthand for `stun:host:port`.
fn normalize_stun_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        bail!("empty stun server entry");
    }
    if ["stun:", "stuns:", "turn:", "turns:"]
        .iter()
        .any(|scheme| trimmed.starts_with(scheme))
    {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("stun:{trimmed}"))
    }
}
