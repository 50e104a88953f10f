//! Wire-level building blocks for Connect, gRPC and gRPC-Web.
//!
//! This crate holds everything that is shared by the handler side
//! (`rpcwire`) and the client side (`rpcwire-client`) and does not depend
//! on a particular HTTP stack.
//!
//! ## Modules
//!
//! - [`code`]: status codes and their HTTP mappings
//! - [`error`]: the coded [`Error`] and [`ErrorDetail`]
//! - [`spec`]: per-call descriptors
//! - [`pool`]: bounded object pools
//! - [`compression`]: pooled compressors and negotiation
//! - [`codec`]: protobuf and JSON message codecs
//! - [`envelope`]: length-prefixed framing
//! - [`unary`]: whole-body messages
//! - [`connect`], [`grpc`]: protocol-specific wire details
//! - [`context`]: deadlines and cancellation

pub mod body;
pub mod code;
pub mod codec;
pub mod compression;
pub mod connect;
pub mod context;
pub mod envelope;
pub mod error;
pub mod grpc;
pub mod pool;
pub mod protocol;
pub mod spec;
pub mod unary;

pub use body::BodyStream;
pub use code::Code;
pub use codec::{Codec, RpcMessage};
pub use compression::{CompressionPool, CompressionPools, Negotiated};
pub use context::{CallContext, CancelHandle};
pub use envelope::{Envelope, EnvelopeReader, EnvelopeWriter, Next, envelope_flags};
pub use error::{Error, ErrorDetail};
pub use pool::{BufferPool, Pool, Pooled};
pub use protocol::Protocol;
pub use spec::{IdempotencyLevel, Spec, StreamType};
pub use unary::{UnaryPayload, UnaryReader, UnaryWriter};

/// Reading a second message of a unary call.
pub fn unary_cardinality_error(what: &str, zero: bool) -> Error {
    if zero {
        Error::unimplemented(format!("unary {what} has zero messages"))
    } else {
        Error::unimplemented(format!("unary {what} has multiple messages"))
    }
}
