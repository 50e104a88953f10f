//! gRPC and gRPC-Web handler conns.

use futures::StreamExt;
use http::request::Parts;
use http::{HeaderMap, HeaderValue, header};
use rpcwire_core::grpc;
use rpcwire_core::{
    BodyStream, CallContext, EnvelopeReader, EnvelopeWriter, Error, Negotiated, Spec,
};

use crate::body::{BodySink, RequestStream};
use crate::config::HandlerConfig;
use crate::conn::{Framing, HandlerConn, HeadSender, Reader, Writer, header_str};
use crate::sniff::{Detected, Wire};

/// Build the conn for a gRPC or gRPC-Web request.
///
/// Like its Connect counterpart, a negotiation failure is returned next to
/// a conn that can still encode it.
pub(crate) fn new_conn(
    detected: &Detected,
    parts: &Parts,
    body: axum::body::Body,
    config: &HandlerConfig,
    spec: &Spec,
    head: HeadSender,
    sink: BodySink,
) -> (HandlerConn, Option<Error>) {
    let headers = &parts.headers;
    let web = detected.wire == Wire::Grpc { web: true };
    let mut failure: Option<Error> = None;

    let negotiated = config
        .compression
        .negotiate(
            header_str(headers, grpc::HEADER_COMPRESSION),
            header_str(headers, grpc::HEADER_ACCEPT_COMPRESSION),
        )
        .unwrap_or_else(|err| {
            failure.get_or_insert(err);
            Negotiated::default()
        });
    let codec = detected.codec.unwrap_or_else(|| config.default_codec());

    let ctx = match grpc::parse_timeout(header_str(headers, grpc::HEADER_TIMEOUT)) {
        Ok(Some(timeout)) => CallContext::new().with_timeout(timeout),
        Ok(None) => CallContext::new(),
        Err(err) => {
            failure.get_or_insert(Error::invalid_argument(err.to_string()));
            CallContext::new()
        }
    };

    let mut base = HeaderMap::new();
    if let Ok(content_type) =
        HeaderValue::from_str(&grpc::content_type_from_codec_name(web, codec.name()))
    {
        base.insert(header::CONTENT_TYPE, content_type);
    }
    if let Some(pool) = &negotiated.response {
        if let Ok(name) = HeaderValue::from_str(pool.name()) {
            base.insert(grpc::HEADER_COMPRESSION, name);
        }
    }
    if !config.compression.is_empty() {
        if let Ok(names) = HeaderValue::from_str(&config.compression.comma_separated_names()) {
            base.insert(grpc::HEADER_ACCEPT_COMPRESSION, names);
        }
    }

    let stream: RequestStream = BodyStream::new(body).boxed();
    let buffers = config.buffers.clone();
    let reader = EnvelopeReader::new(stream, codec, buffers.clone())
        .compression(negotiated.request.clone())
        .read_max_bytes(config.read_max_bytes);
    let writer = EnvelopeWriter::new(codec, buffers)
        .compression(negotiated.response)
        .compress_min_bytes(config.compress_min_bytes)
        .send_max_bytes(config.send_max_bytes);

    let conn = HandlerConn::new(
        spec.clone(),
        detected.wire,
        parts.headers.clone(),
        ctx,
        Reader::Envelope {
            reader,
            done: false,
        },
        Writer::new(head, base, sink, Framing::Envelope(writer)),
    );
    (conn, failure)
}
