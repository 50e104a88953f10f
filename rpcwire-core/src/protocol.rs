//! Protocol identification and headers shared by all three protocols.

use std::fmt;

use http::{HeaderMap, HeaderName};

/// The wire protocols a call can speak.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Connect,
    Grpc,
    GrpcWeb,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Connect => "connect",
            Protocol::Grpc => "grpc",
            Protocol::GrpcWeb => "grpcweb",
        }
    }

    pub fn is_grpc_family(&self) -> bool {
        matches!(self, Protocol::Grpc | Protocol::GrpcWeb)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub const HEADER_X_USER_AGENT: &str = "x-user-agent";

/// Headers owned by the protocols. Application metadata must not use them.
const PROTOCOL_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-post",
    "allow",
    "connect-accept-encoding",
    "connect-content-encoding",
    "connect-protocol-version",
    "connect-timeout-ms",
    "content-encoding",
    "content-length",
    "content-type",
    "date",
    "grpc-accept-encoding",
    "grpc-encoding",
    "grpc-message",
    "grpc-status",
    "grpc-status-details-bin",
    "grpc-timeout",
    "host",
    "te",
    "trailer",
    "transfer-encoding",
    "vary",
    "x-user-agent",
];

/// Whether `name` is reserved by one of the protocols.
pub fn is_protocol_header(name: &HeaderName) -> bool {
    let name = name.as_str();
    PROTOCOL_HEADERS.contains(&name) || name.starts_with("trailer-")
}

/// Append every header of `from` to `into`.
pub fn merge_headers(into: &mut HeaderMap, from: &HeaderMap) {
    for (name, value) in from {
        into.append(name.clone(), value.clone());
    }
}

/// Append application headers of `from` to `into`, skipping reserved names.
pub fn merge_non_protocol_headers(into: &mut HeaderMap, from: &HeaderMap) {
    for (name, value) in from {
        if !is_protocol_header(name) {
            into.append(name.clone(), value.clone());
        }
    }
}
