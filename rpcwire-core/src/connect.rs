//! Connect protocol wire details shared by handlers and clients.
//!
//! Covers content types, the `Connect-Timeout-Ms` header, GET query
//! parameters, the JSON error body and the streaming end-of-stream message.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::code::Code;
use crate::codec::{CODEC_JSON, CODEC_JSON_CHARSET_UTF8, Codec};
use crate::error::{Error, ErrorDetail};
use crate::spec::StreamType;

pub const UNARY_CONTENT_TYPE_PREFIX: &str = "application/";
pub const STREAMING_CONTENT_TYPE_PREFIX: &str = "application/connect+";

pub const HEADER_TIMEOUT: &str = "connect-timeout-ms";
pub const HEADER_PROTOCOL_VERSION: &str = "connect-protocol-version";
pub const HEADER_STREAMING_CONTENT_ENCODING: &str = "connect-content-encoding";
pub const HEADER_STREAMING_ACCEPT_ENCODING: &str = "connect-accept-encoding";
pub const UNARY_TRAILER_PREFIX: &str = "trailer-";

pub const PROTOCOL_VERSION: &str = "1";
pub const QUERY_CONNECT_VALUE: &str = "v1";

/// Longest timeout header accepted, in digits.
const MAX_TIMEOUT_DIGITS: usize = 10;

/// Codec name from a Connect content type.
pub fn codec_name_from_content_type(stream_type: StreamType, content_type: &str) -> &str {
    let prefix = match stream_type {
        StreamType::Unary => UNARY_CONTENT_TYPE_PREFIX,
        _ => STREAMING_CONTENT_TYPE_PREFIX,
    };
    content_type.strip_prefix(prefix).unwrap_or(content_type)
}

pub fn content_type_from_codec_name(stream_type: StreamType, name: &str) -> String {
    match stream_type {
        StreamType::Unary => format!("{UNARY_CONTENT_TYPE_PREFIX}{name}"),
        _ => format!("{STREAMING_CONTENT_TYPE_PREFIX}{name}"),
    }
}

/// Parse `Connect-Timeout-Ms`. `None` means no deadline.
pub fn parse_timeout(value: Option<&str>) -> Result<Option<Duration>, Error> {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    if value.len() > MAX_TIMEOUT_DIGITS {
        return Err(Error::invalid_argument(format!(
            "parse timeout: {value:?} has >10 digits"
        )));
    }
    let millis: u64 = value
        .parse()
        .map_err(|e| Error::invalid_argument(format!("parse timeout: {e}")))?;
    Ok(Some(Duration::from_millis(millis)))
}

/// Encode a remaining timeout. Expired or oversized timeouts are omitted.
pub fn encode_timeout(timeout: Duration) -> Option<String> {
    let millis = timeout.as_millis();
    if millis == 0 {
        return None;
    }
    let encoded = millis.to_string();
    (encoded.len() <= MAX_TIMEOUT_DIGITS).then_some(encoded)
}

/// Validate the protocol version marker of a request.
pub fn check_protocol_version(
    method: &Method,
    query_version: Option<&str>,
    header_version: Option<&str>,
    required: bool,
) -> Result<(), Error> {
    let (version, name, expected, what) = if method == Method::GET {
        (query_version, "connect", QUERY_CONNECT_VALUE, "query parameter")
    } else if method == Method::POST {
        (header_version, HEADER_PROTOCOL_VERSION, PROTOCOL_VERSION, "header")
    } else {
        return Err(Error::invalid_argument(format!(
            "unsupported method: {:?}",
            method.as_str()
        )));
    };
    match version.filter(|v| !v.is_empty()) {
        None if required => Err(Error::invalid_argument(format!(
            "missing required {what}: set {name} to {expected:?}"
        ))),
        Some(version) if version != expected => Err(Error::invalid_argument(format!(
            "{name} must be {expected:?}: got {version:?}"
        ))),
        _ => Ok(()),
    }
}

/// Query parameters of a unary GET request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl GetQuery {
    pub fn parse(query: &str) -> Result<Self, Error> {
        serde_qs::from_str(query)
            .map_err(|e| Error::invalid_argument(format!("parse query: {e}")))
    }

    pub fn encode(&self) -> Result<String, Error> {
        serde_qs::to_string(self).map_err(|e| Error::internal(format!("encode query: {e}")))
    }

    pub fn is_base64(&self) -> bool {
        self.base64.as_deref() == Some("1")
    }

    /// The raw message bytes, undoing base64 when flagged.
    pub fn message_bytes(&self) -> Result<Bytes, Error> {
        let message = self.message.as_deref().unwrap_or_default();
        if !self.is_base64() {
            return Ok(Bytes::copy_from_slice(message.as_bytes()));
        }
        decode_binary_query_value(message).map(Bytes::from)
    }
}

/// URL-safe base64 without padding.
pub fn encode_binary_query_value(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// URL-safe base64, padded or not.
pub fn decode_binary_query_value(value: &str) -> Result<Vec<u8>, Error> {
    let decoded = if value.len() % 4 != 0 {
        URL_SAFE_NO_PAD.decode(value)
    } else {
        URL_SAFE.decode(value)
    };
    decoded.map_err(|e| Error::invalid_argument(format!("decode message: {e}")))
}

/// Standard base64 without padding, as used for binary metadata.
pub fn encode_binary_header(data: &[u8]) -> String {
    STANDARD_NO_PAD.encode(data)
}

/// Standard base64, padded or not.
pub fn decode_binary_header(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if value.len() % 4 != 0 {
        STANDARD_NO_PAD.decode(value)
    } else {
        STANDARD.decode(value)
    }
}

/// One entry of the `details` array in a JSON error.
#[derive(Clone, Debug, PartialEq)]
pub struct WireDetail(pub ErrorDetail);

#[derive(Serialize, Deserialize)]
struct WireDetailJson {
    #[serde(rename = "type")]
    type_name: String,
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    debug: Option<serde_json::Value>,
}

impl Serialize for WireDetail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireDetailJson {
            type_name: self.0.type_name().to_string(),
            value: encode_binary_header(self.0.value()),
            debug: self.0.debug().cloned(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WireDetail {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireDetailJson::deserialize(deserializer)?;
        let value = decode_binary_header(&wire.value)
            .map_err(|e| serde::de::Error::custom(format!("decode base64: {e}")))?;
        let mut detail = ErrorDetail::new(wire.type_name, value);
        if let Some(debug) = wire.debug {
            detail = detail.with_debug(debug);
        }
        Ok(WireDetail(detail))
    }
}

/// The JSON error body of Connect.
///
/// An unrecognized code deserializes to `None` instead of failing, so the
/// message and details are still usable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(serialize_with = "serialize_code", deserialize_with = "deserialize_code", default)]
    pub code: Option<Code>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<WireDetail>,
}

fn serialize_code<S: Serializer>(code: &Option<Code>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&code.unwrap_or(Code::Unknown))
}

fn deserialize_code<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Code>, D::Error> {
    let text = Option::<String>::deserialize(deserializer)?;
    Ok(text.and_then(|t| t.parse().ok()))
}

impl WireError {
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: Some(err.code()),
            message: err.message().to_string(),
            details: err.details().iter().cloned().map(WireDetail).collect(),
        }
    }

    /// Convert into a wire-origin error, using `fallback` for a missing or
    /// unusable code.
    pub fn into_error(self, fallback: Code) -> Error {
        let code = match self.code {
            Some(Code::Ok) | Some(Code::Other(_)) | None => fallback,
            Some(code) => code,
        };
        let mut err = Error::from_wire(code, self.message);
        err.set_details(self.details.into_iter().map(|d| d.0).collect());
        err
    }
}

/// Payload of the Connect end-of-stream frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndStreamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Vec<String>>,
}

impl EndStreamMessage {
    pub fn new(error: Option<&Error>, trailers: &HeaderMap) -> Self {
        Self {
            error: error.map(WireError::from_error),
            metadata: headers_to_map(trailers),
        }
    }

    pub fn trailers(&self) -> HeaderMap {
        map_to_headers(&self.metadata)
    }
}

/// Multi-valued metadata map as used in JSON bodies.
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

pub fn map_to_headers(map: &BTreeMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(name = %name, "dropping invalid metadata key");
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers
}

/// Client check of a unary response content type.
pub fn validate_unary_response_content_type(
    request_codec: &str,
    method: &Method,
    status: StatusCode,
    content_type: &str,
) -> Result<(), Error> {
    if status != StatusCode::OK {
        if status == StatusCode::NOT_MODIFIED && method == Method::GET {
            return Err(Error::from_wire(Code::Unknown, "HTTP 304: not modified"));
        }
        // Error bodies are always JSON.
        let json = content_type_from_codec_name(StreamType::Unary, CODEC_JSON);
        let json_utf8 = content_type_from_codec_name(StreamType::Unary, CODEC_JSON_CHARSET_UTF8);
        if content_type == json || content_type == json_utf8 {
            return Ok(());
        }
        return Err(Error::new(
            Code::from_http_status(status),
            status.canonical_reason().unwrap_or_default(),
        ));
    }
    let expected = content_type_from_codec_name(StreamType::Unary, request_codec);
    if !content_type.starts_with(UNARY_CONTENT_TYPE_PREFIX) {
        return Err(Error::unknown(format!(
            "invalid content-type: {content_type:?}; expecting {expected:?}"
        )));
    }
    let response_codec = codec_name_from_content_type(StreamType::Unary, content_type);
    if Codec::same_name(response_codec, request_codec) {
        return Ok(());
    }
    Err(Error::internal(format!(
        "invalid content-type: {content_type:?}; expecting {expected:?}"
    )))
}

/// Client check of a streaming response content type.
pub fn validate_stream_response_content_type(
    request_codec: &str,
    content_type: &str,
) -> Result<(), Error> {
    let expected = content_type_from_codec_name(StreamType::BidiStream, request_codec);
    let Some(response_codec) = content_type.strip_prefix(STREAMING_CONTENT_TYPE_PREFIX) else {
        return Err(Error::unknown(format!(
            "invalid content-type: {content_type:?}; expecting {expected:?}"
        )));
    };
    if response_codec != request_codec {
        return Err(Error::internal(format!(
            "invalid content-type: {content_type:?}; expecting {expected:?}"
        )));
    }
    Ok(())
}
