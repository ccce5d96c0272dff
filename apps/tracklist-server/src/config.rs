use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;
use tracklist_core::{BridgeConfig, MemoryConfig};

#[derive(Debug, Parser)]
#[command(
    name = "tracklist-server",
    author,
    version,
    about = "Serves playlists from a callback-driven playlist service over HTTP"
)]
pub struct Cli {
    /// Address to bind the HTTP listener to once the session is up.
    #[arg(long, env = "TRACKLIST_LISTEN_ADDR", default_value = "0.0.0.0:1337")]
    listen_addr: String,

    /// JSON file with the playlists to seed the service with. A small demo
    /// set is used when omitted.
    #[arg(long, env = "TRACKLIST_FIXTURE")]
    fixture: Option<PathBuf>,

    /// Seconds a request may wait on the service before answering 504; 0 waits forever.
    #[arg(long, env = "TRACKLIST_REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    request_timeout_secs: u64,

    /// Re-diff rounds allowed per patch request.
    #[arg(long, env = "TRACKLIST_MAX_PATCH_ROUNDS", default_value_t = 64)]
    max_patch_rounds: u32,

    /// Service pumps before a playlist finishes loading.
    #[arg(long, env = "TRACKLIST_LOAD_DELAY_TICKS", default_value_t = 2)]
    load_delay_ticks: u32,

    /// Service pumps before a submitted change settles.
    #[arg(long, env = "TRACKLIST_SETTLE_DELAY_TICKS", default_value_t = 1)]
    settle_delay_ticks: u32,

    /// Pump interval while the service has work scheduled.
    #[arg(long, env = "TRACKLIST_TICK_MS", default_value_t = 10)]
    tick_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub fixture: Option<PathBuf>,
    pub bridge: BridgeConfig,
    pub memory: MemoryConfig,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.tick_ms > 0, "tick interval must be greater than zero");
        ensure!(
            cli.max_patch_rounds > 0,
            "max patch rounds must be greater than zero"
        );

        let continuation_timeout =
            (cli.request_timeout_secs > 0).then(|| Duration::from_secs(cli.request_timeout_secs));
        Ok(ServerConfig {
            listen_addr,
            fixture: cli.fixture,
            bridge: BridgeConfig {
                continuation_timeout,
                max_patch_rounds: cli.max_patch_rounds,
                ..BridgeConfig::default()
            },
            memory: MemoryConfig {
                load_delay_ticks: cli.load_delay_ticks,
                settle_delay_ticks: cli.settle_delay_ticks,
                tick: Duration::from_millis(cli.tick_ms),
                ..MemoryConfig::default()
            },
        })
    }
}
