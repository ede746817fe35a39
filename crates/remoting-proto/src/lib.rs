//! # Remoting Protocol
//!
//! Wire types, framing and transport codecs for the remoting channel.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// Commands exchanged between peers
pub mod command;

/// Negotiated protocol features
pub mod capability;

/// Frame codec for async streams
pub mod codec;

/// Binary-safe transport codec
pub mod binary_safe;

/// Error types for protocol operations
pub mod error;

pub use frame::{Frame, FrameFlags, Sequencer};
pub use command::{CallId, Command, Failure, FailureKind, ObjectId, Outcome, PipeId};
pub use capability::Capability;
pub use codec::FrameCodec;
pub use binary_safe::{AsyncBinarySafeReader, AsyncBinarySafeWriter, BinarySafeReader, BinarySafeWriter};
pub use error::{ProtocolError, ProxyError};
