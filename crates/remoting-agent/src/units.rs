//! Work units every agent can execute

use async_trait::async_trait;
use bytes::Bytes;
use remoting::{CallContext, Callable, ChannelBuilder, Pipe};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Builder with the standard units registered
pub fn standard_builder(name: &str) -> ChannelBuilder {
    ChannelBuilder::new(name)
        .register::<GetEnvironment>()
        .register::<GetSystemInfo>()
        .register::<RunCommand>()
        .register::<ReadFile>()
}

/// Environment variables of the agent process, skipping names or values that are not UTF-8
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetEnvironment;

#[async_trait]
impl Callable for GetEnvironment {
    const NAME: &'static str = "agent.GetEnvironment";
    type Output = BTreeMap<String, String>;
    type Error = Infallible;

    async fn call(self, _ctx: CallContext) -> Result<BTreeMap<String, String>, Infallible> {
        Ok(std::env::vars_os()
            .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
            .collect())
    }
}

/// Description of the machine an agent runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Operating system family
    pub os: String,
    /// CPU architecture
    pub arch: String,
    /// Process id of the agent
    pub pid: u32,
    /// Working directory of the agent
    pub cwd: Option<PathBuf>,
    /// Agent version
    pub version: String,
    /// Name of the channel the request arrived on
    pub channel: String,
}

/// Ask the agent for its [`SystemInfo`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetSystemInfo;

#[async_trait]
impl Callable for GetSystemInfo {
    const NAME: &'static str = "agent.GetSystemInfo";
    const RESTRICTED_SAFE: bool = true;
    type Output = SystemInfo;
    type Error = Infallible;

    async fn call(self, ctx: CallContext) -> Result<SystemInfo, Infallible> {
        Ok(SystemInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
            cwd: std::env::current_dir().ok(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            channel: ctx.channel().name().to_string(),
        })
    }
}

/// Run a process to completion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCommand {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Data written to the process's stdin
    pub stdin: Option<Bytes>,
    /// Limit on the run time
    pub timeout: Option<Duration>,
}

impl RunCommand {
    /// Command running `program` with `args`
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = vec![program.into()];
        argv.extend(args.into_iter().map(Into::into));
        Self {
            argv,
            ..Self::default()
        }
    }
}

/// Result of [`RunCommand`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code, -1 when terminated by a signal
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: Bytes,
    /// Captured stderr
    pub stderr: Bytes,
    /// Wall-clock run time
    pub duration: Duration,
}

#[async_trait]
impl Callable for RunCommand {
    const NAME: &'static str = "agent.RunCommand";
    type Output = CommandOutput;
    type Error = io::Error;

    async fn call(self, _ctx: CallContext) -> Result<CommandOutput, io::Error> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        debug!("Executing process: {:?}", self.argv);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let started = Instant::now();
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Some(data) = &self.stdin {
                if let Err(e) = stdin.write_all(data).await {
                    warn!("Failed to write to process stdin: {}", e);
                }
            }
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out after {:?}", program, limit)))??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            duration: started.elapsed(),
        })
    }
}

/// Stream a file into a pipe read by the caller; returns the byte count
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadFile {
    /// File to read
    pub path: PathBuf,
    /// Pipe created with [`Pipe::create_remote_to_local`]
    pub sink: Pipe,
}

#[async_trait]
impl Callable for ReadFile {
    const NAME: &'static str = "agent.ReadFile";
    type Output = u64;
    type Error = io::Error;

    async fn call(self, _ctx: CallContext) -> Result<u64, io::Error> {
        let mut out = self
            .sink
            .get_out()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "pipe is not writable here"))?;
        let mut file = tokio::fs::File::open(&self.path).await?;

        let mut buf = vec![0u8; 32 * 1024];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        out.close().await?;
        debug!("Streamed {} bytes of {:?}", total, self.path);
        Ok(total)
    }
}
