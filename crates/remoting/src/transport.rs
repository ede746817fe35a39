//! Stream pairs a channel can run over

use crate::{Channel, ChannelBuilder, ChannelError};
use std::net::SocketAddr;
use std::process::Stdio;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Open a channel over a TCP connection to `addr`
pub async fn connect_tcp<A: ToSocketAddrs>(builder: ChannelBuilder, addr: A) -> Result<Channel, ChannelError> {
    let stream = TcpStream::connect(addr).await?;
    open_tcp(builder, stream).await
}

/// Accept one connection on `listener` and open a channel over it
pub async fn accept_tcp(builder: ChannelBuilder, listener: &TcpListener) -> Result<(Channel, SocketAddr), ChannelError> {
    let (stream, peer) = listener.accept().await?;
    info!("Accepted connection from {}", peer);
    Ok((open_tcp(builder, stream).await?, peer))
}

async fn open_tcp(builder: ChannelBuilder, stream: TcpStream) -> Result<Channel, ChannelError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    builder.build(reader, writer).await
}

/// Spawn `command` and open a channel over its stdin and stdout.
///
/// The child's stderr is inherited. The child is killed when the returned
/// handle is dropped.
pub async fn spawn_child(builder: ChannelBuilder, mut command: Command) -> Result<(Channel, Child), ChannelError> {
    debug!("Spawning {:?}", command.as_std());
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ChannelError::Transport(format!("Failed to start {:?}: {}", command.as_std().get_program(), e)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ChannelError::Transport("child stdin is not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ChannelError::Transport("child stdout is not piped".to_string()))?;

    let channel = builder.build(stdout, stdin).await?;
    Ok((channel, child))
}

/// Open a channel over this process's stdin and stdout
pub async fn from_stdio(builder: ChannelBuilder) -> Result<Channel, ChannelError> {
    builder.build(tokio::io::stdin(), tokio::io::stdout()).await
}
