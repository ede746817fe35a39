//! Channels over real sockets

mod common;

use common::*;
use remoting::transport::{accept_tcp, connect_tcp};
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::test]
async fn test_tcp_round_trip() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let (accepted, connected) = tokio::join!(accept_tcp(builder("server"), &listener), connect_tcp(builder("client"), addr));
    let (server, peer) = accepted?;
    let client = connected?;
    assert!(peer.ip().is_loopback());

    assert_eq!(client.call(Add(19, 23)).await?, 42);
    assert_eq!(server.call(Add(1, 2)).await?, 3);

    client.close().await?;
    server.join_timeout(Duration::from_secs(5)).await?;
    assert!(server.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = connect_tcp(builder("client"), addr).await.unwrap_err();
    assert!(matches!(err, remoting::ChannelError::Transport(_)));
}
