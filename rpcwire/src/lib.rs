//! # rpcwire
//!
//! Serve a procedure to Connect, gRPC and gRPC-Web clients from one
//! implementation, mounted on an [axum](https://github.com/tokio-rs/axum)
//! router.
//!
//! - [`Handler`] sniffs the protocol of each request, negotiates codec and
//!   compression, and runs the [`Implementation`] with a [`HandlerConn`].
//! - [`HandlerConn`] receives request messages, sends response messages and
//!   carries headers and trailers. The protocol-specific end of the call is
//!   written when the implementation returns.
//! - [`HandlerConfig`] holds codecs, compression and size limits.
//!
//! Wire-level building blocks live in [`rpcwire_core`], re-exported here.

mod body;
mod config;
mod conn;
mod connect;
mod grpc;
mod handler;
mod sniff;

pub use config::HandlerConfig;
pub use conn::HandlerConn;
pub use handler::{BoxFuture, Handler, Implementation};

pub use rpcwire_core;
pub use rpcwire_core::{
    CallContext, Code, Codec, CompressionPool, CompressionPools, Error, ErrorDetail,
    IdempotencyLevel, Protocol, RpcMessage, Spec, StreamType,
};
