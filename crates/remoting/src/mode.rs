//! Transmission modes and the preamble handshake
//!
//! Some transports print garbage before the peer program starts talking (a
//! login banner, a shell warning). Each side therefore writes a preamble
//! naming its mode and scans the inbound stream until it sees one.

use crate::ChannelError;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

const BINARY_PREAMBLE: &[u8] = &[0, 0, 0, 0];
const TEXT_PREAMBLE: &[u8] = b"<===[REMOTING TRANSMISSION BEGINS]===>";
const MAX_HEADER: usize = 64 * 1024;

/// Encoding used on the stream pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Raw frames
    #[default]
    Binary,
    /// Frames wrapped in the binary-safe text codec, for transports that
    /// mangle control bytes
    Text,
    /// Follow whatever mode the peer announces. Two negotiating peers wait
    /// for each other forever.
    Negotiate,
}

impl Mode {
    /// Bytes announcing this mode, empty for [`Mode::Negotiate`]
    pub fn preamble(self) -> &'static [u8] {
        match self {
            Mode::Binary => BINARY_PREAMBLE,
            Mode::Text => TEXT_PREAMBLE,
            Mode::Negotiate => &[],
        }
    }
}

struct Matcher {
    mode: Mode,
    matched: usize,
}

impl Matcher {
    fn feed(&mut self, byte: u8) -> bool {
        let preamble = self.mode.preamble();
        if preamble[self.matched] == byte {
            self.matched += 1;
        } else {
            self.matched = usize::from(preamble[0] == byte);
        }
        self.matched == preamble.len()
    }
}

/// Announce `requested` and wait for the peer's announcement.
///
/// Returns the mode in effect and, when `capture_header` is set, whatever the
/// peer sent before its preamble.
pub(crate) async fn negotiate<R, W>(
    requested: Mode,
    reader: &mut R,
    writer: &mut W,
    capture_header: bool,
) -> Result<(Mode, Option<Bytes>), ChannelError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if requested != Mode::Negotiate {
        writer.write_all(requested.preamble()).await?;
        writer.flush().await?;
    }

    let mut matchers = [
        Matcher { mode: Mode::Binary, matched: 0 },
        Matcher { mode: Mode::Text, matched: 0 },
    ];
    let mut header = Vec::new();

    let found = loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ChannelError::Transport("Unexpected termination of the channel".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if capture_header && header.len() < MAX_HEADER {
            header.push(byte);
        }
        if let Some(mode) = matchers.iter_mut().find_map(|m| m.feed(byte).then_some(m.mode)) {
            break mode;
        }
    };

    let mode = match (requested, found) {
        (Mode::Negotiate, found) => {
            writer.write_all(found.preamble()).await?;
            writer.flush().await?;
            found
        }
        (requested, found) if requested == found => found,
        (requested, found) => {
            return Err(ChannelError::Handshake(format!(
                "Protocol negotiation failure: requested {:?}, peer announced {:?}",
                requested, found
            )))
        }
    };
    debug!("Transmission mode {:?}", mode);

    let header = capture_header.then(|| {
        let keep = header.len().saturating_sub(mode.preamble().len());
        header.truncate(keep);
        Bytes::from(header)
    });
    Ok((mode, header))
}
