//! # rpcwire-client
//!
//! Call Connect, gRPC and gRPC-Web servers through one conn abstraction.
//!
//! - [`Client`] opens a [`ClientConn`] per call and joins the procedure
//!   path onto its base URL.
//! - [`ClientConn`] sends request messages and receives response messages
//!   with the same contract for every protocol and stream type. Headers and
//!   trailers of the response are available once they arrived.
//! - [`ClientConfig`] picks protocol, codec, compression, size limits and
//!   Connect GET behavior.
//! - [`HyperTransport`] wraps a pooled hyper client with optional TLS.
//!
//! Transport failures are mapped onto status codes, so every failure a
//! caller sees is an [`Error`] with a [`Code`].

mod classify;
mod client;
mod config;
mod conn;
mod connect;
mod duplex;
mod grpc;
pub mod transport;

pub use client::Client;
pub use config::{ClientConfig, ConfigError, DEFAULT_GET_URL_MAX_BYTES};
pub use conn::ClientConn;
pub use duplex::RequestHeaders;
pub use transport::{HyperTransport, HyperTransportBuilder, TlsClientConfig};

pub use rpcwire_core;
pub use rpcwire_core::{
    CallContext, CancelHandle, Code, Codec, CompressionPool, CompressionPools, Error,
    ErrorDetail, IdempotencyLevel, Protocol, RpcMessage, Spec, StreamType,
};
