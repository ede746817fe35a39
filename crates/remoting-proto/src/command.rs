//! Commands exchanged between the two peers of a channel

use crate::{Capability, ProtocolError, ProxyError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an outstanding request, unique per direction until resolved
pub type CallId = u64;

/// Handle of an exported object, meaningful only on the channel that issued it
pub type ObjectId = u32;

/// Identifier of one end of a pipe in the table of the peer that owns it
pub type PipeId = u32;

/// The atomic unit of wire traffic.
///
/// Payloads of requests and responses are encoded separately from this
/// envelope, so a payload that cannot be decoded only affects the request it
/// belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Feature announcement, always the first command in each direction
    Capability(Capability),

    /// Execute a registered work unit
    UserRequest {
        /// Call identifier
        id: CallId,
        /// Registered name of the unit
        unit: String,
        /// Encoded unit state
        payload: Bytes,
        /// Code base the callee should resolve classes and resources from
        loader: Option<ObjectId>,
        /// Counted references inside the payload, one entry per count
        refs: Vec<ObjectId>,
        /// Call site that issued the request
        created_at: Option<String>,
    },

    /// Invoke a method on an exported object
    RpcRequest {
        /// Call identifier
        id: CallId,
        /// Target object
        oid: ObjectId,
        /// Method name
        method: String,
        /// Encoded arguments
        args: Bytes,
        /// Counted references inside the arguments, one entry per count
        refs: Vec<ObjectId>,
        /// Call site that issued the request
        created_at: Option<String>,
    },

    /// Result of a `UserRequest` or `RpcRequest`
    Response {
        /// Call identifier of the request being answered
        id: CallId,
        /// Value or failure
        outcome: Outcome,
    },

    /// The sender dropped `count` references to an object exported by the receiver
    Unexport {
        /// Object handle
        oid: ObjectId,
        /// Number of references released
        count: u32,
    },

    /// Binds the receiver's pipe end `target` to the sender's end `peer`
    PipeConnect {
        /// Pipe end on the receiving side
        target: PipeId,
        /// Pipe end on the sending side
        peer: PipeId,
    },

    /// A chunk of pipe data
    PipeData {
        /// Receiving pipe end
        target: PipeId,
        /// Chunk contents
        data: Bytes,
    },

    /// The reader consumed `size` bytes and the writer may send that much more
    PipeAck {
        /// Writing pipe end
        target: PipeId,
        /// Number of bytes consumed
        size: u32,
    },

    /// The writer closed its end
    PipeEof {
        /// Reading pipe end
        target: PipeId,
    },

    /// The reader is gone; further writes must fail
    PipeDead {
        /// Writing pipe end
        target: PipeId,
    },

    /// Orderly shutdown. Nothing follows this command in the same direction.
    Close {
        /// Site that initiated the shutdown
        created_at: Option<String>,
        /// Diagnostic reason
        cause: Option<String>,
    },
}

impl Command {
    /// Serialize the envelope to MessagePack bytes
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize an envelope from MessagePack bytes
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Whether the command belongs to pipe traffic
    pub fn is_pipe(&self) -> bool {
        matches!(
            self,
            Command::PipeConnect { .. }
                | Command::PipeData { .. }
                | Command::PipeAck { .. }
                | Command::PipeEof { .. }
                | Command::PipeDead { .. }
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Capability(cap) => write!(f, "Capability({:?})", cap),
            Command::UserRequest { id, unit, payload, .. } => {
                write!(f, "UserRequest(#{}, unit={}, {} bytes)", id, unit, payload.len())
            }
            Command::RpcRequest { id, oid, method, .. } => {
                write!(f, "RpcRequest(#{}, oid={}, method={})", id, oid, method)
            }
            Command::Response { id, outcome } => match outcome {
                Outcome::Value(v) => write!(f, "Response(#{}, {} bytes)", id, v.len()),
                Outcome::Failure(failure) => {
                    write!(f, "Response(#{}, {:?}: {})", id, failure.kind, failure.error)
                }
            },
            Command::Unexport { oid, count } => write!(f, "Unexport(oid={}, count={})", oid, count),
            Command::PipeConnect { target, peer } => {
                write!(f, "PipeConnect(target={}, peer={})", target, peer)
            }
            Command::PipeData { target, data } => {
                write!(f, "PipeData(target={}, {} bytes)", target, data.len())
            }
            Command::PipeAck { target, size } => write!(f, "PipeAck(target={}, size={})", target, size),
            Command::PipeEof { target } => write!(f, "PipeEof(target={})", target),
            Command::PipeDead { target } => write!(f, "PipeDead(target={})", target),
            Command::Close { cause, .. } => match cause {
                Some(cause) => write!(f, "Close({})", cause),
                None => f.write_str("Close"),
            },
        }
    }
}

/// Eventual result of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// Encoded return value
    Value(Bytes),
    /// The request failed on the executing side
    Failure(Failure),
}

impl Outcome {
    /// Shorthand for a failure without a transportable error image
    pub fn failure(kind: FailureKind, error: ProxyError) -> Self {
        Outcome::Failure(Failure {
            kind,
            typed: None,
            error,
        })
    }
}

/// Failure reported by the executing side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// What went wrong
    pub kind: FailureKind,
    /// Encoded original error, present when its type is transportable
    pub typed: Option<Bytes>,
    /// Textual rendition of the error and its causes, always present
    pub error: ProxyError,
}

/// Classification of a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The unit or method returned an error
    Execution,
    /// The unit or method panicked
    Panic,
    /// The request payload could not be decoded
    Deserialization,
    /// The return value could not be encoded
    Serialization,
    /// No unit with that name is registered on the executing side
    UnknownUnit,
    /// The object handle is not exported
    UnknownObject,
    /// The object does not implement the method
    UnknownMethod,
    /// The executing side refused the request
    Refused,
}
