//! Running an agent channel until it closes

use anyhow::{Context, Result};
use remoting::transport::{accept_tcp, from_stdio};
use remoting::{Channel, ChannelBuilder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// How long a TCP launcher waits for its single connection
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Periodic liveness check of the peer
#[derive(Debug, Clone, Copy)]
pub struct PingConfig {
    /// Time between two pings
    pub interval: Duration,
    /// Limit on one ping round trip
    pub timeout: Duration,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            timeout: Duration::from_secs(240),
        }
    }
}

/// Where the channel's streams come from
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// This process's stdin and stdout
    Stdio,
    /// One connection accepted on an ephemeral port announced in `port_file`
    Tcp {
        /// Address to listen on
        bind: String,
        /// File receiving the port number, removed once connected
        port_file: PathBuf,
        /// Limit on waiting for the connection
        accept_timeout: Duration,
    },
}

/// Launcher settings
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Stream source
    pub endpoint: Endpoint,
    /// Liveness check, off when `None`
    pub ping: Option<PingConfig>,
}

/// How an agent run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The channel closed
    Closed,
    /// The peer stopped answering pings
    Unresponsive,
}

/// Open the channel, then serve it until it closes or the watchdog fires
pub async fn run(builder: ChannelBuilder, config: LauncherConfig) -> Result<Exit> {
    let channel = open(builder, &config.endpoint).await?;
    info!("Channel {} established ({:?} mode)", channel.name(), channel.mode());
    Ok(serve(&channel, config.ping).await)
}

/// Open the channel on `endpoint`
pub async fn open(builder: ChannelBuilder, endpoint: &Endpoint) -> Result<Channel> {
    match endpoint {
        Endpoint::Stdio => from_stdio(builder).await.context("Failed to open channel over stdio"),
        Endpoint::Tcp {
            bind,
            port_file,
            accept_timeout,
        } => listen_once(builder, bind, port_file, *accept_timeout).await,
    }
}

/// Accept exactly one connection on an ephemeral port written to `port_file`
pub async fn listen_once(
    builder: ChannelBuilder,
    bind: &str,
    port_file: &Path,
    accept_timeout: Duration,
) -> Result<Channel> {
    let listener = TcpListener::bind((bind, 0))
        .await
        .with_context(|| format!("Failed to listen on {}", bind))?;
    let port = listener.local_addr()?.port();
    tokio::fs::write(port_file, port.to_string())
        .await
        .with_context(|| format!("Failed to write port file {}", port_file.display()))?;
    info!("Waiting for a connection on port {}", port);

    let accepted = tokio::time::timeout(accept_timeout, accept_tcp(builder, &listener)).await;
    if let Err(e) = tokio::fs::remove_file(port_file).await {
        warn!("Failed to remove port file {}: {}", port_file.display(), e);
    }

    let (channel, peer) = accepted
        .map_err(|_| anyhow::anyhow!("No connection within {:?}", accept_timeout))?
        .context("Failed to establish channel")?;
    info!("Connected to {}", peer);
    Ok(channel)
}

/// Wait for the channel to close, pinging the peer if configured
pub async fn serve(channel: &Channel, ping: Option<PingConfig>) -> Exit {
    let Some(ping) = ping else {
        channel.join().await;
        return Exit::Closed;
    };

    tokio::select! {
        biased;
        _ = channel.join() => Exit::Closed,
        _ = watchdog(channel, ping) => {
            // a ping cut short by an orderly close is not a dead peer
            if channel.is_closed() {
                return Exit::Closed;
            }
            let _ = channel.close().await;
            Exit::Unresponsive
        }
    }
}

/// Returns when a ping round trip fails
async fn watchdog(channel: &Channel, config: PingConfig) {
    let mut ticks = tokio::time::interval(config.interval);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        match tokio::time::timeout(config.timeout, channel.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Ping on {} failed: {}", channel.name(), e);
                return;
            }
            Err(_) => {
                error!("Ping on {} got no answer within {:?}", channel.name(), config.timeout);
                return;
            }
        }
    }
}
