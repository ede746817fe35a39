//! Error types for the remoting channel

use remoting_proto::{FailureKind, ProtocolError, ProxyError};
use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;

/// Channel-level failures
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// The channel no longer accepts or delivers commands
    #[error("Channel {channel} is closed{}", cause_suffix(.cause))]
    Closed {
        /// Channel name
        channel: String,
        /// What brought the channel down
        cause: Option<String>,
    },

    /// The underlying stream failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The peer violated the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Preamble or capability exchange failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// A value could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A value could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Timeout errors
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// The operation is not permitted on a restricted channel
    #[error("Refused on restricted channel: {0}")]
    Restricted(String),

    /// The caller passed something the channel cannot act on
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

fn cause_suffix(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(": {}", cause),
        None => String::new(),
    }
}

impl From<ProtocolError> for ChannelError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Transport(e.to_string()),
            ProtocolError::Serialization(msg) => Self::Protocol(format!("Malformed command: {}", msg)),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ChannelError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(format!("MessagePack encode error: {}", err))
    }
}

impl From<rmp_serde::decode::Error> for ChannelError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Deserialization(format!("MessagePack decode error: {}", err))
    }
}

/// Failure of a remote call.
///
/// `E` is the error type of the work unit. Errors that can be rebuilt on this
/// side arrive as [`CallError::Remote`]; everything else arrives as a
/// [`ProxyError`] that preserves the message and cause chain as text.
#[derive(Debug, Error)]
pub enum CallError<E = Infallible> {
    /// The unit returned its own error and it survived the trip
    #[error("{0}")]
    Remote(E),

    /// The request failed remotely and only its textual rendition survived
    #[error("Remote {kind:?} failure: {error}")]
    Proxy {
        /// Classification of the failure
        kind: FailureKind,
        /// Message and cause chain of the original error
        #[source]
        error: ProxyError,
    },

    /// The channel failed before a result arrived
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl<E> CallError<E> {
    /// Proxy error of a failure that could not be rebuilt locally
    pub fn proxy(&self) -> Option<&ProxyError> {
        match self {
            CallError::Proxy { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Failure classification reported by the executing side
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            CallError::Remote(_) => Some(FailureKind::Execution),
            CallError::Proxy { kind, .. } => Some(*kind),
            CallError::Channel(_) => None,
        }
    }

    /// Whether the failure came from the channel rather than the remote side
    pub fn is_channel(&self) -> bool {
        matches!(self, CallError::Channel(_))
    }

    /// Convert the unit error, keeping proxy and channel failures as they are
    pub fn map_remote<F, O>(self, f: O) -> CallError<F>
    where
        O: FnOnce(E) -> F,
    {
        match self {
            CallError::Remote(e) => CallError::Remote(f(e)),
            CallError::Proxy { kind, error } => CallError::Proxy { kind, error },
            CallError::Channel(e) => CallError::Channel(e),
        }
    }
}

impl CallError<Infallible> {
    /// Widen a call error with no unit error into any other error type
    pub fn widen<F>(self) -> CallError<F> {
        self.map_remote(|never| match never {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_display() {
        let err = ChannelError::Closed {
            channel: "north".to_string(),
            cause: Some("orderly shutdown".to_string()),
        };
        assert_eq!(err.to_string(), "Channel north is closed: orderly shutdown");

        let err = ChannelError::Closed { channel: "south".to_string(), cause: None };
        assert_eq!(err.to_string(), "Channel south is closed");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let io = ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(ChannelError::from(io), ChannelError::Transport(_)));

        let bad = ProtocolError::OutOfOrder { expected: 1, actual: 3 };
        assert!(matches!(ChannelError::from(bad), ChannelError::Protocol(_)));
    }

    #[test]
    fn test_call_error_accessors() {
        let err: CallError = CallError::Proxy {
            kind: FailureKind::Panic,
            error: ProxyError::new("boom"),
        };
        assert_eq!(err.kind(), Some(FailureKind::Panic));
        assert_eq!(err.proxy().map(|p| p.message()), Some("boom"));
        assert!(!err.is_channel());

        let widened: CallError<std::io::Error> = CallError::Channel(ChannelError::Transport("x".into())).widen();
        assert!(widened.is_channel());
    }
}
