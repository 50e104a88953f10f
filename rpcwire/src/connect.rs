//! Connect handler conns: unary (POST and GET) and streaming.

use futures::{StreamExt, future, stream};
use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, header};
use rpcwire_core::connect::{self, GetQuery};
use rpcwire_core::{
    BodyStream, CallContext, EnvelopeReader, EnvelopeWriter, Error, Negotiated, Spec, StreamType,
    UnaryReader, UnaryWriter,
};

use crate::body::{BodySink, RequestStream};
use crate::config::HandlerConfig;
use crate::conn::{Framing, HandlerConn, HeadSender, Reader, Writer, header_str};
use crate::sniff::{Detected, Wire};

/// Build the conn for a Connect request.
///
/// Returns the first negotiation failure alongside the conn. The conn is
/// then set up with defaults so the failure itself can still be encoded.
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
    let get = detected.wire == Wire::ConnectUnary { get: true };
    let unary = matches!(detected.wire, Wire::ConnectUnary { .. });
    let mut failure: Option<Error> = None;

    let query = if get {
        GetQuery::parse(parts.uri.query().unwrap_or_default()).unwrap_or_else(|err| {
            failure.get_or_insert(err);
            GetQuery::default()
        })
    } else {
        GetQuery::default()
    };

    let (sent, accept) = match detected.wire {
        Wire::ConnectUnary { get: true } => (
            query.compression.as_deref(),
            header_str(headers, header::ACCEPT_ENCODING),
        ),
        Wire::ConnectUnary { get: false } => (
            header_str(headers, header::CONTENT_ENCODING),
            header_str(headers, header::ACCEPT_ENCODING),
        ),
        _ => (
            header_str(headers, connect::HEADER_STREAMING_CONTENT_ENCODING),
            header_str(headers, connect::HEADER_STREAMING_ACCEPT_ENCODING),
        ),
    };
    let negotiated = config
        .compression
        .negotiate(sent, accept)
        .unwrap_or_else(|err| {
            failure.get_or_insert(err);
            Negotiated::default()
        });

    let codec = detected.codec.unwrap_or_else(|| {
        failure.get_or_insert(Error::invalid_argument("missing encoding parameter"));
        config.default_codec()
    });

    if let Err(err) = connect::check_protocol_version(
        &parts.method,
        query.connect.as_deref(),
        header_str(headers, connect::HEADER_PROTOCOL_VERSION),
        config.require_connect_protocol_header,
    ) {
        failure.get_or_insert(err);
    }

    let stream: RequestStream = if get {
        match query.message.as_ref().map(|_| query.message_bytes()) {
            Some(Ok(message)) => stream::once(future::ready(Ok(message))).boxed(),
            Some(Err(err)) => {
                failure.get_or_insert(err);
                stream::empty().boxed()
            }
            None => {
                failure.get_or_insert(Error::invalid_argument("missing message parameter"));
                stream::empty().boxed()
            }
        }
    } else {
        BodyStream::new(body).boxed()
    };

    let ctx = match connect::parse_timeout(header_str(headers, connect::HEADER_TIMEOUT)) {
        Ok(Some(timeout)) => CallContext::new().with_timeout(timeout),
        Ok(None) => CallContext::new(),
        Err(err) => {
            failure.get_or_insert(err);
            CallContext::new()
        }
    };

    let stream_type = if unary {
        StreamType::Unary
    } else {
        spec.stream_type
    };
    let mut base = HeaderMap::new();
    if let Ok(content_type) = HeaderValue::from_str(&connect::content_type_from_codec_name(
        stream_type,
        &detected.codec_name,
    )) {
        base.insert(header::CONTENT_TYPE, content_type);
    }
    if !config.compression.is_empty() {
        let accept_name = if unary {
            header::ACCEPT_ENCODING
        } else {
            HeaderName::from_static(connect::HEADER_STREAMING_ACCEPT_ENCODING)
        };
        if let Ok(names) = HeaderValue::from_str(&config.compression.comma_separated_names()) {
            base.insert(accept_name, names);
        }
    }
    if get {
        base.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    }

    let buffers = config.buffers.clone();
    let (reader, framing) = if unary {
        let reader = UnaryReader::new(codec, buffers.clone())
            .compression(negotiated.request.clone())
            .read_max_bytes(config.read_max_bytes);
        let writer = UnaryWriter::new(codec, buffers)
            .compression(negotiated.response.clone())
            .compress_min_bytes(config.compress_min_bytes)
            .send_max_bytes(config.send_max_bytes);
        (
            Reader::Unary {
                stream,
                reader,
                done: false,
            },
            Framing::Unary(writer),
        )
    } else {
        if let Some(pool) = &negotiated.response {
            if let Ok(name) = HeaderValue::from_str(pool.name()) {
                base.insert(connect::HEADER_STREAMING_CONTENT_ENCODING, name);
            }
        }
        let reader = EnvelopeReader::new(stream, codec, buffers.clone())
            .compression(negotiated.request.clone())
            .read_max_bytes(config.read_max_bytes);
        let writer = EnvelopeWriter::new(codec, buffers)
            .compression(negotiated.response.clone())
            .compress_min_bytes(config.compress_min_bytes)
            .send_max_bytes(config.send_max_bytes);
        (
            Reader::Envelope {
                reader,
                done: false,
            },
            Framing::Envelope(writer),
        )
    };

    let conn = HandlerConn::new(
        spec.clone(),
        detected.wire,
        parts.headers.clone(),
        ctx,
        reader,
        Writer::new(head, base, sink, framing),
    );
    (conn, failure)
}
