//! # Remoting
//!
//! A bidirectional command channel between two processes over any stream
//! pair: stdio of a child process, a TCP connection, or an in-memory duplex.
//!
//! Either side can send work units for the other to execute
//! ([`Channel::call`]), export objects whose methods the peer can invoke
//! ([`Channel::export`]), stream bytes through [`Pipe`]s, and let the peer
//! fetch class images and resources on demand from a [`CodeBase`].
//!
//! ```no_run
//! use remoting::{CallContext, Callable, ChannelBuilder};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Add(u32, u32);
//!
//! #[async_trait::async_trait]
//! impl Callable for Add {
//!     const NAME: &'static str = "example.Add";
//!     type Output = u32;
//!     type Error = std::convert::Infallible;
//!
//!     async fn call(self, _ctx: CallContext) -> Result<u32, Self::Error> {
//!         Ok(self.0 + self.1)
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (left, right) = tokio::io::duplex(64 * 1024);
//! let (lr, lw) = tokio::io::split(left);
//! let (rr, rw) = tokio::io::split(right);
//! let (a, b) = tokio::join!(
//!     ChannelBuilder::new("a").build(lr, lw),
//!     ChannelBuilder::new("b").register::<Add>().build(rr, rw),
//! );
//! let (a, _b) = (a?, b?);
//! assert_eq!(a.call(Add(2, 3)).await?, 5);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use remoting_proto as proto;

/// Error types for the remoting channel
pub mod error;

/// Channel configuration and construction
pub mod builder;

/// The channel runtime
pub mod channel;

/// Work units and call futures
pub mod call;

/// Exported objects and remote references
pub mod export;

/// Code bases and the remote loader bridge
pub mod loader;

/// Byte streams across a channel
pub mod pipe;

/// Transmission modes
pub mod mode;

/// Listeners and counters
pub mod diagnostics;

/// TCP, child-process and stdio transports
pub mod transport;

mod current;

pub use builder::{ChannelBuilder, ChannelConfig, DecodeFailurePolicy};
pub use call::{CallContext, Callable, Ping, RemoteFuture, UnitError, UnitRegistry};
pub use channel::{Channel, ChannelState};
pub use diagnostics::{ChannelListener, PerformanceCounters};
pub use error::{CallError, ChannelError};
pub use export::{ExportList, ExportRecording, MethodCall, MethodError, ObjectRef, RemoteObject};
pub use loader::{Archive, CodeBase, LoadedClass, RemoteLoader, Resource};
pub use mode::Mode;
pub use pipe::{Pipe, PipeReader, PipeWriter};
pub use remoting_proto::{Capability, FailureKind, ProxyError};

#[doc(hidden)]
pub mod __private {
    pub use rmp_serde;
}
