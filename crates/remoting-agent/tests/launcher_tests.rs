//! Launching agents and running the standard units against them

use remoting::proto::{Command, Frame, FrameCodec};
use remoting::transport::connect_tcp;
use remoting::{Capability, Channel, ChannelBuilder, FailureKind, Mode, Pipe};
use remoting_agent::launcher::{listen_once, serve};
use remoting_agent::units::{GetEnvironment, GetSystemInfo, ReadFile, RunCommand};
use remoting_agent::{standard_builder, Exit, PingConfig};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;

async fn connected() -> (Channel, Channel) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    let (controller, agent) = tokio::join!(
        ChannelBuilder::new("controller").build(ar, aw),
        standard_builder("agent").build(br, bw),
    );
    (controller.expect("controller"), agent.expect("agent"))
}

#[tokio::test]
async fn test_tcp_launch_announces_port() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port_file = dir.path().join("agent.port");

    let listening = {
        let port_file = port_file.clone();
        tokio::spawn(async move {
            listen_once(standard_builder("agent"), "127.0.0.1", &port_file, Duration::from_secs(5)).await
        })
    };

    let mut port = None;
    for _ in 0..200 {
        if let Ok(text) = tokio::fs::read_to_string(&port_file).await {
            if let Ok(value) = text.trim().parse::<u16>() {
                port = Some(value);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let port = port.expect("port file");

    let controller = connect_tcp(ChannelBuilder::new("controller"), ("127.0.0.1", port)).await?;
    let agent = listening.await??;
    assert!(!port_file.exists());

    let info = controller.call(GetSystemInfo).await?;
    assert_eq!(info.channel, "agent");
    assert_eq!(info.pid, std::process::id());

    controller.close().await?;
    agent.join_timeout(Duration::from_secs(5)).await?;
    Ok(())
}

#[tokio::test]
async fn test_tcp_launch_gives_up() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port_file = dir.path().join("agent.port");

    let result = listen_once(standard_builder("agent"), "127.0.0.1", &port_file, Duration::from_millis(100)).await;
    let err = result.unwrap_err();
    assert!(err.to_string().contains("No connection"));
    assert!(!port_file.exists());
    Ok(())
}

#[tokio::test]
async fn test_serve_returns_when_closed() -> anyhow::Result<()> {
    let (controller, agent) = connected().await;
    let ping = PingConfig {
        interval: Duration::from_millis(20),
        timeout: Duration::from_secs(5),
    };

    let serving = tokio::spawn(async move { serve(&agent, Some(ping)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.close().await?;

    assert_eq!(tokio::time::timeout(Duration::from_secs(5), serving).await??, Exit::Closed);
    Ok(())
}

#[tokio::test]
async fn test_watchdog_detects_silent_peer() -> anyhow::Result<()> {
    let (x, y) = tokio::io::duplex(64 * 1024);
    let (xr, xw) = tokio::io::split(x);
    let (mut yr, mut yw) = tokio::io::split(y);

    // a peer that completes the handshake and then never answers
    let silent = tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        yw.write_all(Mode::Binary.preamble()).await?;
        let hello = Command::Capability(Capability::current()).to_msgpack()?;
        FrameCodec::new().write_frame(&mut yw, &Frame::data(0, hello.into())).await?;
        let mut sink = Vec::new();
        yr.read_to_end(&mut sink).await?;
        drop(yw);
        anyhow::Ok(())
    });

    let agent = standard_builder("agent").build(xr, xw).await?;
    let ping = PingConfig {
        interval: Duration::from_millis(20),
        timeout: Duration::from_millis(50),
    };
    let exit = tokio::time::timeout(Duration::from_secs(5), serve(&agent, Some(ping))).await?;
    assert_eq!(exit, Exit::Unresponsive);
    silent.abort();
    Ok(())
}

#[tokio::test]
async fn test_environment_matches_agent_process() -> anyhow::Result<()> {
    let (controller, _agent) = connected().await;

    let env: BTreeMap<String, String> = controller.call(GetEnvironment).await?;
    assert_eq!(env.get("PATH").cloned(), std::env::var("PATH").ok());
    assert!(env.len() <= std::env::vars_os().count());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_command() -> anyhow::Result<()> {
    let (controller, _agent) = connected().await;

    let mut command = RunCommand::new("sh", ["-c", "cat; echo \"$GREETING\" >&2; exit 3"]);
    command.stdin = Some(bytes::Bytes::from_static(b"from stdin"));
    command.env.insert("GREETING".to_string(), "hello".to_string());

    let output = controller.call(command).await?;
    assert_eq!(output.exit_code, 3);
    assert_eq!(&output.stdout[..], b"from stdin");
    assert_eq!(&output.stderr[..], b"hello\n");
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_command_timeout() {
    let (controller, _agent) = connected().await;

    let mut command = RunCommand::new("sleep", ["10"]);
    command.timeout = Some(Duration::from_millis(100));

    let err = controller.call(command).await.unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Execution));
    assert!(err.proxy().unwrap().message().contains("timed out"));
}

#[tokio::test]
async fn test_empty_command_is_rejected() {
    let (controller, _agent) = connected().await;

    let err = controller.call(RunCommand::default()).await.unwrap_err();
    assert!(err.proxy().unwrap().message().contains("empty command"));
}

#[tokio::test]
async fn test_read_file_through_pipe() -> anyhow::Result<()> {
    let (controller, _agent) = connected().await;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("payload.bin");
    let content: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    tokio::fs::write(&path, &content).await?;

    let sink = Pipe::create_remote_to_local();
    let mut input = sink.get_in().expect("reading end");
    let call = controller.call_async(ReadFile { path, sink });

    let mut received = Vec::new();
    let (read, total) = tokio::join!(input.read_to_end(&mut received), call);
    read?;
    assert_eq!(total?, content.len() as u64);
    assert!(received == content);
    Ok(())
}

#[tokio::test]
async fn test_read_missing_file() {
    let (controller, _agent) = connected().await;

    let sink = Pipe::create_remote_to_local();
    let _input = sink.get_in();
    let err = controller
        .call(ReadFile {
            path: "/definitely/not/here".into(),
            sink,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::Execution));
}
