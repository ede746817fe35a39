//! Remoting agent binary
//!
//! Executes work units sent by a controller until the channel closes.

use anyhow::Result;
use clap::Parser;
use remoting::Mode;
use remoting_agent::{run, standard_builder, Endpoint, Exit, LauncherConfig, PingConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "remoting-agent", version, about = "Executes work units sent over a remoting channel")]
struct Args {
    /// Encode the stream so it survives text-only transports
    #[arg(long)]
    text: bool,

    /// Ping the controller and exit when it stops answering
    #[arg(long)]
    ping: bool,

    /// Seconds between pings
    #[arg(long, default_value_t = 600)]
    ping_interval: u64,

    /// Seconds to wait for a ping answer
    #[arg(long, default_value_t = 240)]
    ping_timeout: u64,

    /// Listen on an ephemeral TCP port and write it to this file instead of using stdio
    #[arg(long, value_name = "PORT_FILE")]
    tcp: Option<PathBuf>,

    /// Address to listen on with --tcp
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Refuse work units from the controller
    #[arg(long)]
    restricted: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout may carry the channel
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    info!("Starting remoting agent {}", env!("CARGO_PKG_VERSION"));

    let builder = standard_builder("agent")
        .with_mode(if args.text { Mode::Text } else { Mode::Binary })
        .with_restricted(args.restricted);
    let endpoint = match args.tcp {
        Some(port_file) => Endpoint::Tcp {
            bind: args.bind,
            port_file,
            accept_timeout: remoting_agent::launcher::ACCEPT_TIMEOUT,
        },
        None => Endpoint::Stdio,
    };
    let ping = args.ping.then(|| PingConfig {
        interval: Duration::from_secs(args.ping_interval),
        timeout: Duration::from_secs(args.ping_timeout),
    });

    match run(builder, LauncherConfig { endpoint, ping }).await? {
        Exit::Closed => {
            info!("Agent shutting down");
            Ok(())
        }
        Exit::Unresponsive => {
            error!("Controller stopped responding");
            std::process::exit(1);
        }
    }
}
