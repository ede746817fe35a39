//! Channel configuration and construction

use crate::call::{Callable, UnitRegistry};
use crate::channel::{BoxReader, BoxWriter};
use crate::loader::CodeBase;
use crate::mode::{self, Mode};
use crate::pipe::DEFAULT_PIPE_WINDOW;
use crate::{Channel, ChannelError};
use bytes::Bytes;
use remoting_proto::codec::MAX_FRAME_SIZE;
use remoting_proto::{
    AsyncBinarySafeReader, AsyncBinarySafeWriter, Capability, Command, Frame, FrameCodec, Sequencer,
};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// What the reader does with a command envelope it cannot decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeFailurePolicy {
    /// Log and keep reading
    #[default]
    Skip,
    /// Terminate the channel
    Terminate,
}

/// Channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Human readable name used in logs and errors
    pub name: String,
    /// Requested transmission mode
    pub mode: Mode,
    /// Refuse work units that are not marked safe and never load code from the peer
    pub restricted: bool,
    /// Features advertised to the peer
    pub capability: Capability,
    /// Requests from the peer executing at the same time
    pub max_concurrent_calls: usize,
    /// Limit applied to every outgoing call
    pub call_timeout: Option<Duration>,
    /// Credit window of pipe writers
    pub pipe_window: usize,
    /// Handling of undecodable command envelopes
    pub decode_failure_policy: DecodeFailurePolicy,
    /// Keep whatever the peer sent before its preamble
    pub capture_header: bool,
    /// How long `close()` waits for outstanding calls before announcing shutdown
    pub close_drain_timeout: Option<Duration>,
    /// Code base sent with requests that do not name one
    pub code_base: Option<CodeBase>,
    /// Largest frame accepted or produced
    pub max_frame_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "channel".to_string(),
            mode: Mode::default(),
            restricted: false,
            capability: Capability::current(),
            max_concurrent_calls: 100,
            call_timeout: None,
            pipe_window: DEFAULT_PIPE_WINDOW,
            decode_failure_policy: DecodeFailurePolicy::default(),
            capture_header: false,
            close_drain_timeout: None,
            code_base: None,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Everything the handshake established, handed to the running channel
pub(crate) struct Established {
    pub mode: Mode,
    pub header: Option<Bytes>,
    pub remote_capability: Capability,
    pub reader: BoxReader,
    pub writer: BoxWriter,
    pub codec_in: FrameCodec,
    pub codec_out: FrameCodec,
    pub seq_in: Sequencer,
    pub seq_out: Sequencer,
}

/// Builder for configuring and opening a [`Channel`]
#[derive(Debug, Clone)]
pub struct ChannelBuilder {
    config: ChannelConfig,
    registry: UnitRegistry,
}

impl ChannelBuilder {
    /// Create a new builder for a channel called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: ChannelConfig {
                name: name.into(),
                ..ChannelConfig::default()
            },
            registry: UnitRegistry::new(),
        }
    }

    /// Set the transmission mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Mark the channel restricted
    pub fn with_restricted(mut self, restricted: bool) -> Self {
        self.config.restricted = restricted;
        self
    }

    /// Advertise a different feature set
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.config.capability = capability;
        self
    }

    /// Bound the number of peer requests executing at once
    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.config.max_concurrent_calls = max.max(1);
        self
    }

    /// Fail outgoing calls that take longer than `timeout`
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Set the pipe credit window in bytes
    pub fn with_pipe_window(mut self, window: usize) -> Self {
        self.config.pipe_window = window.max(1);
        self
    }

    /// Choose how undecodable envelopes are handled
    pub fn with_decode_failure_policy(mut self, policy: DecodeFailurePolicy) -> Self {
        self.config.decode_failure_policy = policy;
        self
    }

    /// Keep the bytes the peer sent before its preamble
    pub fn with_header_capture(mut self, capture: bool) -> Self {
        self.config.capture_header = capture;
        self
    }

    /// Let `close()` wait up to `timeout` for outstanding calls
    pub fn with_close_drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_drain_timeout = Some(timeout);
        self
    }

    /// Send `code_base` with every request that does not name one
    pub fn with_code_base(mut self, code_base: CodeBase) -> Self {
        self.config.code_base = Some(code_base);
        self
    }

    /// Set the largest frame accepted or produced
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.config.max_frame_size = max;
        self
    }

    /// Allow the peer to execute `U` on this side
    pub fn register<U: Callable>(mut self) -> Self {
        self.registry.register::<U>();
        self
    }

    /// Current configuration
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Run the handshake over the stream pair and start the channel
    pub async fn build<R, W>(self, mut reader: R, mut writer: W) -> Result<Channel, ChannelError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let config = self.config;
        info!("Opening channel {} in {:?} mode", config.name, config.mode);

        let (mode, header) = mode::negotiate(config.mode, &mut reader, &mut writer, config.capture_header).await?;
        let (mut reader, mut writer): (BoxReader, BoxWriter) = match mode {
            Mode::Text => (
                Box::new(AsyncBinarySafeReader::new(reader)),
                Box::new(AsyncBinarySafeWriter::new(writer)),
            ),
            _ => (Box::new(reader), Box::new(writer)),
        };

        let codec_out = FrameCodec::with_max_frame_size(config.max_frame_size);
        let mut codec_in = FrameCodec::with_max_frame_size(config.max_frame_size);
        let mut seq_out = Sequencer::new();
        let mut seq_in = Sequencer::new();

        let hello = Command::Capability(config.capability).to_msgpack()?;
        codec_out
            .write_frame(&mut writer, &Frame::data(seq_out.advance(), Bytes::from(hello)))
            .await
            .map_err(|e| ChannelError::Handshake(format!("Failed to announce capability: {}", e)))?;

        let frame = codec_in
            .read_frame(&mut reader)
            .await?
            .ok_or_else(|| ChannelError::Handshake("Unexpected termination of the channel".to_string()))?;
        seq_in.accept(&frame)?;
        let remote_capability = match Command::from_msgpack(&frame.payload)? {
            Command::Capability(capability) => capability,
            other => {
                return Err(ChannelError::Handshake(format!(
                    "Expected capability announcement, received {}",
                    other
                )))
            }
        };
        debug!("Peer capability {:?}", remote_capability);

        Ok(Channel::start(
            config,
            self.registry,
            Established {
                mode,
                header,
                remote_capability,
                reader,
                writer,
                codec_in,
                codec_out,
                seq_in,
                seq_out,
            },
        ))
    }
}
