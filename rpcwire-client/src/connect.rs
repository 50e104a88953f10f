//! Connect client specifics: request headers, GET encoding and response
//! parsing for unary and streaming calls.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use rpcwire_core::connect::{self, EndStreamMessage, GetQuery, WireError};
use rpcwire_core::{
    CallContext, Code, CompressionPool, Envelope, Error, RpcMessage, StreamType, UnaryPayload,
    UnaryWriter, envelope_flags,
};

use crate::config::ClientConfig;

/// Upper bound on an error body read when no read limit is configured.
const ERROR_BODY_MAX_BYTES: usize = 1024 * 1024;

pub(crate) fn request_headers(
    config: &ClientConfig,
    stream_type: StreamType,
    ctx: &CallContext,
) -> HeaderMap {
    let unary = stream_type == StreamType::Unary;
    let mut headers = HeaderMap::new();
    if let Ok(content_type) = HeaderValue::from_str(&connect::content_type_from_codec_name(
        stream_type,
        config.codec.name(),
    )) {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    if let Ok(user_agent) = HeaderValue::from_str(&config.user_agent_value()) {
        headers.insert(header::USER_AGENT, user_agent);
    }
    headers.insert(
        connect::HEADER_PROTOCOL_VERSION,
        HeaderValue::from_static(connect::PROTOCOL_VERSION),
    );
    if let Some(timeout) = ctx.remaining().and_then(connect::encode_timeout) {
        if let Ok(timeout) = HeaderValue::from_str(&timeout) {
            headers.insert(connect::HEADER_TIMEOUT, timeout);
        }
    }
    let accept = HeaderValue::from_str(&config.compression.comma_separated_names()).ok();
    if unary {
        if let Some(accept) = accept.filter(|_| !config.compression.is_empty()) {
            headers.insert(header::ACCEPT_ENCODING, accept);
        }
        return headers;
    }
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    if let Some(name) = &config.send_compression {
        if let Ok(name) = HeaderValue::from_str(name) {
            headers.insert(connect::HEADER_STREAMING_CONTENT_ENCODING, name);
        }
    }
    if let Some(accept) = accept.filter(|_| !config.compression.is_empty()) {
        headers.insert(connect::HEADER_STREAMING_ACCEPT_ENCODING, accept);
    }
    headers
}

/// How a unary request goes out.
#[derive(Debug)]
pub(crate) enum UnaryRequest {
    Get(Uri),
    Post(UnaryPayload),
}

/// Encode a unary request, as a GET when allowed and the URL fits.
///
/// The message is stably marshaled once. An uncompressed URL is tried
/// first, then a compressed one; past that the request falls back to POST
/// or fails, per configuration.
pub(crate) fn prepare_unary<M: RpcMessage>(
    writer: &UnaryWriter,
    config: &ClientConfig,
    use_get: bool,
    base: &Uri,
    message: &M,
) -> Result<UnaryRequest, Error> {
    if !use_get {
        return writer.marshal(message).map(UnaryRequest::Post);
    }
    let mut buf = writer.buffers().get();
    writer.codec().marshal_stable(message, &mut buf)?;
    let data = buf.split().freeze();

    let send_max = writer.send_max();
    let too_big = send_max > 0 && data.len() > send_max;
    if too_big && writer.compression_pool().is_none() {
        return Err(Error::resource_exhausted(format!(
            "message size {} exceeds sendMaxBytes {send_max}: enabling request compression may help",
            data.len()
        )));
    }

    let budget = config.get_url_max_bytes;
    let fits = |uri: &Uri| budget == 0 || uri.to_string().len() < budget;

    let mut failure = None;
    if !too_big {
        let uri = get_uri(base, writer, &data, None)?;
        if fits(&uri) {
            return Ok(UnaryRequest::Get(uri));
        }
        failure = Some(format!(
            "url size {} exceeds getURLMaxBytes {budget}",
            uri.to_string().len()
        ));
    }
    // The GET path compresses regardless of compress_min_bytes.
    let mut compressed = None;
    if let Some(pool) = writer.compression_pool() {
        let mut buf = writer.buffers().get();
        pool.compress(&data, &mut buf)?;
        let payload = buf.split().freeze();
        if send_max > 0 && payload.len() > send_max {
            return Err(Error::resource_exhausted(format!(
                "compressed message size {} exceeds sendMaxBytes {send_max}",
                payload.len()
            )));
        }
        let uri = get_uri(base, writer, &payload, Some(pool.name()))?;
        if fits(&uri) {
            return Ok(UnaryRequest::Get(uri));
        }
        failure = Some(format!(
            "compressed url size {} exceeds getURLMaxBytes {budget}",
            uri.to_string().len()
        ));
        compressed = Some(UnaryPayload {
            data: payload,
            compression: Some(pool.name().to_string()),
        });
    }
    if config.get_use_fallback {
        tracing::debug!("GET url over budget, falling back to POST");
        return match compressed {
            Some(payload) => Ok(UnaryRequest::Post(payload)),
            None => writer.finish(data).map(UnaryRequest::Post),
        };
    }
    let mut message =
        failure.unwrap_or_else(|| format!("url size exceeds getURLMaxBytes {budget}"));
    if writer.compression_pool().is_none() {
        message.push_str(": enabling request compression may help");
    }
    Err(Error::resource_exhausted(message))
}

fn get_uri(
    base: &Uri,
    writer: &UnaryWriter,
    data: &[u8],
    compression: Option<&str>,
) -> Result<Uri, Error> {
    let codec = writer.codec();
    let mut query = GetQuery {
        connect: Some(connect::QUERY_CONNECT_VALUE.to_string()),
        encoding: Some(codec.name().to_string()),
        compression: compression.map(str::to_string),
        ..GetQuery::default()
    };
    let text = match (codec.is_binary() || compression.is_some(), std::str::from_utf8(data)) {
        (false, Ok(text)) => Some(text),
        _ => None,
    };
    match text {
        Some(text) => query.message = Some(text.to_string()),
        None => {
            query.base64 = Some("1".to_string());
            query.message = Some(connect::encode_binary_query_value(data));
        }
    }
    format!("{base}?{}", query.encode()?)
        .parse()
        .map_err(|e| Error::internal(format!("build GET url: {e}")))
}

/// Strip the GET-irrelevant headers off a request turned into a GET.
pub(crate) fn strip_get_headers(headers: &mut HeaderMap) {
    headers.remove(connect::HEADER_PROTOCOL_VERSION);
    headers.remove(header::CONTENT_TYPE);
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);
}

/// Split `Trailer-` prefixed headers off a unary response.
pub(crate) fn split_unary_trailers(headers: &HeaderMap) -> (HeaderMap, HeaderMap) {
    let mut plain = HeaderMap::new();
    let mut trailers = HeaderMap::new();
    for (name, value) in headers {
        match name.as_str().strip_prefix(connect::UNARY_TRAILER_PREFIX) {
            Some(stripped) => {
                if let Ok(stripped) = HeaderName::from_bytes(stripped.as_bytes()) {
                    trailers.append(stripped, value.clone());
                }
            }
            None => {
                plain.append(name.clone(), value.clone());
            }
        }
    }
    (plain, trailers)
}

/// Read and decode the JSON error body of a non-200 unary response.
pub(crate) async fn unary_error<S>(
    status: StatusCode,
    stream: &mut S,
    compression: Option<&CompressionPool>,
    read_max_bytes: usize,
) -> Error
where
    S: futures::Stream<Item = Result<Bytes, Error>> + Unpin,
{
    let limit = if read_max_bytes > 0 {
        read_max_bytes
    } else {
        ERROR_BODY_MAX_BYTES
    };
    let fallback = || Error::new(Code::from_http_status(status), format!("HTTP status {status}"));
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) if body.len() + chunk.len() <= limit => body.extend_from_slice(&chunk),
            Ok(_) => return fallback(),
            Err(err) => return err,
        }
    }
    let body = match compression {
        Some(pool) if !body.is_empty() => {
            let mut decompressed = BytesMut::new();
            if let Err(err) = pool.decompress(&body, &mut decompressed, limit as u64) {
                return err;
            }
            decompressed
        }
        _ => body,
    };
    match serde_json::from_slice::<WireError>(&body) {
        Ok(wire) => wire.into_error(Code::from_http_status(status)),
        Err(e) => {
            tracing::debug!(error = %e, "undecodable error body");
            fallback()
        }
    }
}

/// Interpret a special frame of a Connect stream.
///
/// Returns the trailers and the final error, if any.
pub(crate) fn end_stream(envelope: &Envelope) -> Result<(HeaderMap, Option<Error>), Error> {
    if !envelope.is_set(envelope_flags::END_STREAM) {
        return Err(Error::internal(format!(
            "protocol error: invalid envelope flags {}",
            envelope.flags
        )));
    }
    let message: EndStreamMessage = serde_json::from_slice(&envelope.data)
        .map_err(|e| Error::unknown(format!("unmarshal end stream message: {e}")))?;
    let trailers = message.trailers();
    let error = message.error.map(|wire| wire.into_error(Code::Unknown));
    Ok((trailers, error))
}
