//! Error types for protocol operations

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid frame format
    #[error("Invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Frame arrived out of order
    #[error("Out of order frame: expected sequence {expected}, got {actual}")]
    OutOfOrder {
        /// Sequence number the reader expected
        expected: u32,
        /// Sequence number that was received
        actual: u32,
    },

    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary-safe stream contained a byte outside the encoding alphabet
    #[error("Invalid encoded sequence encountered:{0}")]
    InvalidEncoding(String),
}

/// Serializable stand-in for a failure raised on the other side of a channel.
///
/// The message of every level embeds the original error text (and, at the top
/// level, its type name when known). The cause chain is rebuilt level by
/// level, so a readable trace survives even when the original error types do
/// not exist on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyError {
    message: String,
    cause: Option<Box<ProxyError>>,
}

impl ProxyError {
    /// Create a proxy error without a cause
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Attach a cause
    pub fn with_cause(mut self, cause: ProxyError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Rebuild the full source chain of `err`, prefixing the top level with
    /// the Rust type name of `E`.
    ///
    /// Only the top level carries a type name. Causes are reached through
    /// `dyn Error` sources, whose concrete types are not nameable, so every
    /// level below keeps its message alone.
    pub fn capture<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut proxy = Self::from_chain(err.source());
        proxy.message = format!("{}: {}", short_type_name::<E>(), err);
        proxy
    }

    /// Rebuild the source chain of a type-erased error
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut proxy = Self::from_chain(err.source());
        proxy.message = err.to_string();
        proxy
    }

    fn from_chain(source: Option<&(dyn std::error::Error + 'static)>) -> Self {
        // collect first, then fold from the innermost cause outwards
        let mut messages = Vec::new();
        let mut next = source;
        while let Some(err) = next {
            messages.push(err.to_string());
            next = err.source();
        }

        let cause = messages
            .into_iter()
            .rev()
            .fold(None, |inner: Option<ProxyError>, message| {
                let mut level = ProxyError::new(message);
                level.cause = inner.map(Box::new);
                Some(level)
            });

        Self {
            message: String::new(),
            cause: cause.map(Box::new),
        }
    }

    /// Message of this level
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Next level of the cause chain
    pub fn cause(&self) -> Option<&ProxyError> {
        self.cause.as_deref()
    }

    /// Iterate over this error and all of its causes, outermost first
    pub fn chain(&self) -> impl Iterator<Item = &ProxyError> {
        std::iter::successors(Some(self), |e| e.cause())
    }

    /// Multi-line human readable trace
    pub fn trace(&self) -> String {
        let mut out = String::new();
        for (depth, level) in self.chain().enumerate() {
            if depth > 0 {
                out.push_str("\nCaused by: ");
            }
            out.push_str(&level.message);
        }
        out
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

fn short_type_name<E: ?Sized>() -> &'static str {
    let full = std::any::type_name::<E>();
    // keep generic arguments intact, only strip the module path of the outer type
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
