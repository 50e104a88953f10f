//! Classification of transport failures into coded errors.

use std::error::Error as StdError;

use h2::Reason;
use rpcwire_core::body::BoxError;
use rpcwire_core::{Error, Protocol};

const H2C_REFUSED: &[&str] = &["frame with invalid size", "invalid preface"];
const H2C_REQUIRED: &[&str] = &["invalid HTTP version parsed"];

/// Classify a failure raised by hyper while issuing a request or reading a
/// response body.
///
/// Errors that already carry a code pass through unchanged.
pub(crate) fn classify_transport(err: &(dyn StdError + 'static)) -> Error {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    let mut incomplete = false;
    while let Some(source) = current {
        if let Some(coded) = source.downcast_ref::<Error>() {
            return coded.clone();
        }
        if let Some(h2_err) = source.downcast_ref::<h2::Error>() {
            if let Some(reason) = h2_err.reason() {
                return from_reason(reason, &chain_message(err));
            }
        }
        if let Some(hyper_err) = source.downcast_ref::<hyper::Error>() {
            if hyper_err.is_canceled() {
                return Error::canceled(chain_message(err));
            }
            if hyper_err.is_timeout() {
                return Error::deadline_exceeded(chain_message(err));
            }
            incomplete |= hyper_err.is_incomplete_message();
        }
        if let Some(io_err) = source.downcast_ref::<std::io::Error>() {
            match io_err.kind() {
                std::io::ErrorKind::TimedOut => {
                    return Error::deadline_exceeded(chain_message(err));
                }
                std::io::ErrorKind::UnexpectedEof => incomplete = true,
                _ => {}
            }
        }
        current = source.source();
    }
    // A clean EOF here is the peer hanging up mid-handshake, not the end of
    // a stream.
    if incomplete {
        return Error::unavailable("unexpected EOF");
    }
    let message = chain_message(err);
    Error::unavailable(with_h2c_hint(message))
}

/// Adapter for [`rpcwire_core::BodyStream::with_classifier`].
pub(crate) fn classify_body(err: BoxError) -> Error {
    classify_transport(&*err)
}

fn from_reason(reason: Reason, message: &str) -> Error {
    match reason {
        Reason::REFUSED_STREAM => Error::unavailable(message.to_string()),
        Reason::CANCEL => Error::canceled(message.to_string()),
        Reason::ENHANCE_YOUR_CALM => Error::resource_exhausted("bandwidth exhausted"),
        Reason::INADEQUATE_SECURITY => Error::permission_denied("transport protocol insecure"),
        _ => Error::internal(message.to_string()),
    }
}

/// hyper's outer errors say little on their own; join the whole chain.
fn chain_message(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        let text = source.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        current = source.source();
    }
    message
}

fn with_h2c_hint(message: String) -> String {
    if H2C_REFUSED.iter().any(|needle| message.contains(needle)) {
        return format!(
            "{message}: possible h2c configuration issue, the server may not accept HTTP/2 without TLS"
        );
    }
    if H2C_REQUIRED.iter().any(|needle| message.contains(needle)) {
        return format!(
            "{message}: possible h2c configuration issue, the server may require HTTP/2; enable http2_only on the transport"
        );
    }
    message
}

/// Rewrite a content-type failure when the response looks like another
/// protocol of the family. The code is kept.
pub(crate) fn with_protocol_hint(err: Error, expected: Protocol, content_type: &str) -> Error {
    let grpc_web = content_type.starts_with("application/grpc-web");
    let grpc = content_type.starts_with("application/grpc") && !grpc_web;
    let connect = content_type.starts_with("application/") && !grpc && !grpc_web;
    let hint = match expected {
        Protocol::Connect if grpc || grpc_web => "the server answered with gRPC",
        Protocol::Grpc if grpc_web => "the server answered with gRPC-Web",
        Protocol::GrpcWeb if grpc => "the server answered with gRPC, not gRPC-Web",
        Protocol::Grpc | Protocol::GrpcWeb if connect => "the server answered with Connect",
        _ => return err,
    };
    let mut hinted = Error::new(
        err.code(),
        format!("{}: possible wrong protocol, {hint}", err.message()),
    );
    hinted.set_details(err.details().to_vec());
    hinted
}
