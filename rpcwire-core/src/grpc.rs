//! gRPC and gRPC-Web wire details shared by handlers and clients.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use prost::Message;

use crate::code::Code;
use crate::codec::CODEC_PROTO;
use crate::connect::{decode_binary_header, encode_binary_header};
use crate::error::{Error, ErrorDetail};
use crate::protocol::merge_non_protocol_headers;

pub const CONTENT_TYPE_DEFAULT: &str = "application/grpc";
pub const WEB_CONTENT_TYPE_DEFAULT: &str = "application/grpc-web";
pub const CONTENT_TYPE_PREFIX: &str = "application/grpc+";
pub const WEB_CONTENT_TYPE_PREFIX: &str = "application/grpc-web+";

pub const HEADER_COMPRESSION: &str = "grpc-encoding";
pub const HEADER_ACCEPT_COMPRESSION: &str = "grpc-accept-encoding";
pub const HEADER_TIMEOUT: &str = "grpc-timeout";
pub const HEADER_STATUS: &str = "grpc-status";
pub const HEADER_MESSAGE: &str = "grpc-message";
pub const HEADER_DETAILS: &str = "grpc-status-details-bin";

/// Largest value of a timeout, exclusive.
const TIMEOUT_MAX_VALUE: u64 = 100_000_000;

/// Hours that still fit a signed 64-bit nanosecond count.
const TIMEOUT_MAX_HOURS: u64 = (i64::MAX as u64) / 3_600_000_000_000;

/// `google.rpc.Status`.
#[derive(Clone, PartialEq, Message)]
pub struct StatusProto {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

pub fn content_type_from_codec_name(web: bool, name: &str) -> String {
    match (web, name) {
        (true, name) => format!("{WEB_CONTENT_TYPE_PREFIX}{name}"),
        (false, CODEC_PROTO) => CONTENT_TYPE_DEFAULT.to_string(),
        (false, name) => format!("{CONTENT_TYPE_PREFIX}{name}"),
    }
}

/// Codec name from a gRPC content type. The bare type means protobuf.
pub fn codec_name_from_content_type(web: bool, content_type: &str) -> &str {
    let (bare, prefix) = if web {
        (WEB_CONTENT_TYPE_DEFAULT, WEB_CONTENT_TYPE_PREFIX)
    } else {
        (CONTENT_TYPE_DEFAULT, CONTENT_TYPE_PREFIX)
    };
    if content_type == bare {
        return CODEC_PROTO;
    }
    content_type.strip_prefix(prefix).unwrap_or(content_type)
}

/// Client check of a response content type.
pub fn validate_response_content_type(
    web: bool,
    request_codec: &str,
    content_type: &str,
) -> Result<(), Error> {
    let (bare, prefix) = if web {
        (WEB_CONTENT_TYPE_DEFAULT, WEB_CONTENT_TYPE_PREFIX)
    } else {
        (CONTENT_TYPE_DEFAULT, CONTENT_TYPE_PREFIX)
    };
    if content_type.strip_prefix(prefix) == Some(request_codec)
        || (request_codec == CODEC_PROTO && content_type == bare)
    {
        return Ok(());
    }
    let expected = if request_codec == CODEC_PROTO {
        bare.to_string()
    } else {
        format!("{prefix}{request_codec}")
    };
    let message = format!("invalid content-type: {content_type:?}; expecting {expected:?}");
    if content_type == bare || content_type.starts_with(prefix) {
        return Err(Error::internal(message));
    }
    Err(Error::unknown(message))
}

/// Error parsing a `grpc-timeout` value.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    #[error("protocol error: timeout {0:?} has invalid unit")]
    InvalidUnit(String),
    #[error("protocol error: invalid timeout {0:?}")]
    Invalid(String),
    #[error("protocol error: timeout {0:?} is too long")]
    TooLong(String),
}

/// Parse `grpc-timeout`. `None` means no deadline, including values too
/// large to represent.
pub fn parse_timeout(value: Option<&str>) -> Result<Option<Duration>, TimeoutError> {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let unit = value.chars().last().unwrap_or_default();
    let digits = &value[..value.len() - unit.len_utf8()];
    let unit_nanos: u64 = match unit {
        'H' => 3_600_000_000_000,
        'M' => 60_000_000_000,
        'S' => 1_000_000_000,
        'm' => 1_000_000,
        'u' => 1_000,
        'n' => 1,
        _ => return Err(TimeoutError::InvalidUnit(value.to_string())),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TimeoutError::Invalid(value.to_string()));
    }
    let num: u64 = digits
        .parse()
        .map_err(|_| TimeoutError::TooLong(value.to_string()))?;
    if num >= TIMEOUT_MAX_VALUE {
        return Err(TimeoutError::TooLong(value.to_string()));
    }
    if unit == 'H' && num > TIMEOUT_MAX_HOURS {
        return Ok(None);
    }
    Ok(Some(Duration::from_nanos(num * unit_nanos)))
}

/// Encode a timeout in the smallest unit that fits eight digits, rounding up.
pub fn encode_timeout(timeout: Duration) -> String {
    if timeout.is_zero() {
        return "0n".to_string();
    }
    let nanos = timeout.as_nanos();
    let max = TIMEOUT_MAX_VALUE as u128;
    let units: [(u128, char); 6] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60_000_000_000, 'M'),
        (3_600_000_000_000, 'H'),
    ];
    let (size, unit) = units
        .iter()
        .copied()
        .find(|(size, _)| nanos < size * max)
        .unwrap_or((3_600_000_000_000, 'H'));
    let value = nanos.div_ceil(size).min(max - 1);
    format!("{value}{unit}")
}

fn should_escape(b: u8) -> bool {
    !(0x20..=0x7e).contains(&b) || b == b'%'
}

/// Percent-encode a `grpc-message` value.
pub fn percent_encode(message: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    if !message.bytes().any(should_escape) {
        return message.to_string();
    }
    let mut out = String::with_capacity(message.len() * 2);
    for b in message.bytes() {
        if should_escape(b) {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        } else {
            out.push(b as char);
        }
    }
    out
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

/// Decode a `grpc-message` value. Malformed escapes are kept literally.
pub fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let (hi, lo) = (bytes[i + 1], bytes[i + 2]);
            if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() {
                out.push(hex_value(hi) << 4 | hex_value(lo));
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Write the status of a finished call into `trailers`.
///
/// Metadata of locally created errors is forwarded; metadata of errors
/// received from another peer is not.
pub fn error_to_trailers(trailers: &mut HeaderMap, err: Option<&Error>) {
    let Some(err) = err else {
        trailers.insert(HEADER_STATUS, HeaderValue::from_static("0"));
        return;
    };
    if !err.is_wire() {
        merge_non_protocol_headers(trailers, err.meta());
    }
    trailers.insert(HEADER_STATUS, HeaderValue::from(err.code().as_u32()));
    if let Ok(message) = HeaderValue::from_str(&percent_encode(err.message())) {
        trailers.insert(HEADER_MESSAGE, message);
    }
    if !err.details().is_empty() {
        let bin = encode_binary_header(&err.to_status_proto());
        if let Ok(bin) = HeaderValue::from_str(&bin) {
            trailers.insert(HEADER_DETAILS, bin);
        }
    }
}

/// Outcome of reading a status out of trailers.
#[derive(Debug)]
pub enum TrailerStatus {
    Ok,
    /// No `grpc-status` at all.
    Missing(Error),
    Error(Error),
}

/// Read the call status from trailers (or headers, for trailers-only
/// responses).
pub fn status_from_trailers(trailers: &HeaderMap) -> TrailerStatus {
    let Some(code) = trailers.get(HEADER_STATUS).and_then(|v| v.to_str().ok()) else {
        let code = if trailers.is_empty() {
            Code::Internal
        } else {
            Code::Unknown
        };
        return TrailerStatus::Missing(Error::new(
            code,
            "protocol error: no grpc-status trailer: unexpected EOF",
        ));
    };
    if code == "0" {
        return TrailerStatus::Ok;
    }
    let Ok(code) = code.parse::<u32>() else {
        return TrailerStatus::Error(Error::unknown(format!(
            "protocol error: invalid error code {code:?}"
        )));
    };
    let message = trailers
        .get(HEADER_MESSAGE)
        .and_then(|v| v.to_str().ok())
        .map(percent_decode)
        .unwrap_or_default();
    let mut err = Error::from_wire(Code::from_u32(code), message);

    let Some(bin) = trailers.get(HEADER_DETAILS).and_then(|v| v.to_str().ok()) else {
        return TrailerStatus::Error(err);
    };
    if bin.is_empty() {
        return TrailerStatus::Error(err);
    }
    let decoded = match decode_binary_header(bin) {
        Ok(decoded) => decoded,
        Err(e) => {
            return TrailerStatus::Error(Error::internal(format!(
                "server returned invalid grpc-status-details-bin trailer: {e}"
            )));
        }
    };
    let status = match StatusProto::decode(decoded.as_slice()) {
        Ok(status) => status,
        Err(e) => {
            return TrailerStatus::Error(Error::internal(format!(
                "server returned invalid protobuf for error details: {e}"
            )));
        }
    };
    // The binary status wins over the plain headers.
    err = Error::from_wire(Code::from_u32(status.code as u32), status.message);
    err.set_details(status.details.into_iter().map(ErrorDetail::from).collect());
    TrailerStatus::Error(err)
}

/// Encode trailers as the body of a gRPC-Web trailer frame.
pub fn encode_web_trailers(trailers: &HeaderMap) -> Bytes {
    let mut buf = BytesMut::new();
    for (name, value) in trailers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.freeze()
}

/// Parse the body of a gRPC-Web trailer frame.
pub fn decode_web_trailers(data: &[u8]) -> Result<HeaderMap, Error> {
    let invalid = |detail: &str| {
        Error::internal(format!("gRPC-Web protocol error: trailers invalid: {detail}"))
    };
    let text = std::str::from_utf8(data).map_err(|e| invalid(&e.to_string()))?;
    let mut trailers = HeaderMap::new();
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(&format!("malformed line {line:?}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| invalid(&e.to_string()))?;
        let value = HeaderValue::from_str(value.trim()).map_err(|e| invalid(&e.to_string()))?;
        trailers.append(name, value);
    }
    Ok(trailers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_from_codec_name(false, "proto"), "application/grpc");
        assert_eq!(content_type_from_codec_name(false, "json"), "application/grpc+json");
        assert_eq!(content_type_from_codec_name(true, "proto"), "application/grpc-web+proto");
        assert_eq!(codec_name_from_content_type(false, "application/grpc"), "proto");
        assert_eq!(codec_name_from_content_type(true, "application/grpc-web+json"), "json");
    }

    #[test]
    fn test_validate_response_content_type() {
        assert!(validate_response_content_type(false, "proto", "application/grpc").is_ok());
        assert!(validate_response_content_type(false, "proto", "application/grpc+proto").is_ok());
        assert!(validate_response_content_type(true, "json", "application/grpc-web+json").is_ok());
        let err = validate_response_content_type(false, "proto", "application/grpc+json").unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        let err = validate_response_content_type(false, "proto", "text/html").unwrap_err();
        assert_eq!(err.code(), Code::Unknown);
        assert_eq!(
            err.message(),
            "invalid content-type: \"text/html\"; expecting \"application/grpc\""
        );
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout(None), Ok(None));
        assert_eq!(parse_timeout(Some("5S")), Ok(Some(Duration::from_secs(5))));
        assert_eq!(parse_timeout(Some("250m")), Ok(Some(Duration::from_millis(250))));
        assert_eq!(parse_timeout(Some("3u")), Ok(Some(Duration::from_micros(3))));
        assert_eq!(parse_timeout(Some("2H")), Ok(Some(Duration::from_secs(7200))));
        assert_eq!(parse_timeout(Some("99999999H")), Ok(None));
        assert_eq!(
            parse_timeout(Some("100000000S")),
            Err(TimeoutError::TooLong("100000000S".into()))
        );
        assert!(matches!(parse_timeout(Some("5x")), Err(TimeoutError::InvalidUnit(_))));
        assert!(matches!(parse_timeout(Some("S")), Err(TimeoutError::Invalid(_))));
        assert!(matches!(parse_timeout(Some("-1S")), Err(TimeoutError::Invalid(_))));
    }

    #[test]
    fn test_encode_timeout() {
        assert_eq!(encode_timeout(Duration::ZERO), "0n");
        assert_eq!(encode_timeout(Duration::from_nanos(1500)), "1500n");
        assert_eq!(encode_timeout(Duration::from_secs(1)), "1000000u");
        assert_eq!(encode_timeout(Duration::from_secs(200)), "200000m");
        assert_eq!(encode_timeout(Duration::from_nanos(100_000_001)), "100001u");
        assert_eq!(encode_timeout(Duration::from_secs(100_000_000)), "1666667M");
        let encoded = encode_timeout(Duration::from_millis(1234));
        assert_eq!(parse_timeout(Some(&encoded)), Ok(Some(Duration::from_millis(1234))));
    }

    #[test]
    fn test_percent_encoding() {
        assert_eq!(percent_encode("plain text"), "plain text");
        assert_eq!(percent_encode("100% sure\n"), "100%25 sure%0A");
        assert_eq!(percent_encode("héllo"), "h%C3%A9llo");
        assert_eq!(percent_decode("h%C3%A9llo"), "héllo");
        assert_eq!(percent_decode("50%"), "50%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn test_status_round_trip_through_trailers() {
        let mut err = Error::permission_denied("not yours\n");
        err.meta_mut().insert("x-reason", "owner".parse().unwrap());
        let err = err.add_detail(ErrorDetail::new("google.rpc.RetryInfo", vec![1, 2]));

        let mut trailers = HeaderMap::new();
        error_to_trailers(&mut trailers, Some(&err));
        assert_eq!(trailers[HEADER_STATUS], "7");
        assert_eq!(trailers[HEADER_MESSAGE], "not yours%0A");
        assert_eq!(trailers["x-reason"], "owner");
        assert!(trailers.contains_key(HEADER_DETAILS));

        match status_from_trailers(&trailers) {
            TrailerStatus::Error(back) => {
                assert_eq!(back.code(), Code::PermissionDenied);
                assert_eq!(back.message(), "not yours\n");
                assert_eq!(back.details().len(), 1);
                assert!(back.is_wire());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wire_error_metadata_is_not_forwarded() {
        let mut err = Error::from_wire(Code::Aborted, "upstream");
        err.meta_mut().insert("x-upstream", "1".parse().unwrap());
        let mut trailers = HeaderMap::new();
        error_to_trailers(&mut trailers, Some(&err));
        assert!(trailers.get("x-upstream").is_none());
    }

    #[test]
    fn test_status_from_trailers_edge_cases() {
        let mut trailers = HeaderMap::new();
        assert!(matches!(
            status_from_trailers(&trailers),
            TrailerStatus::Missing(e) if e.code() == Code::Internal
        ));
        trailers.insert("x-other", "1".parse().unwrap());
        assert!(matches!(
            status_from_trailers(&trailers),
            TrailerStatus::Missing(e) if e.code() == Code::Unknown
        ));
        trailers.insert(HEADER_STATUS, "0".parse().unwrap());
        assert!(matches!(status_from_trailers(&trailers), TrailerStatus::Ok));
        trailers.insert(HEADER_STATUS, "abc".parse().unwrap());
        assert!(matches!(
            status_from_trailers(&trailers),
            TrailerStatus::Error(e) if e.message() == "protocol error: invalid error code \"abc\""
        ));
        trailers.insert(HEADER_STATUS, "99".parse().unwrap());
        assert!(matches!(
            status_from_trailers(&trailers),
            TrailerStatus::Error(e) if e.code() == Code::Other(99)
        ));
    }

    #[test]
    fn test_web_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert(HEADER_STATUS, "0".parse().unwrap());
        trailers.append("x-multi", "a".parse().unwrap());
        trailers.append("x-multi", "b".parse().unwrap());
        let encoded = encode_web_trailers(&trailers);
        assert!(encoded.ends_with(b"\r\n"));
        let decoded = decode_web_trailers(&encoded).unwrap();
        assert_eq!(decoded, trailers);
        assert!(decode_web_trailers(b"no colon here\r\n").is_err());
    }
}
