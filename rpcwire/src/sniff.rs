//! Protocol detection for incoming requests.
//!
//! A request is matched once, by method and `Content-Type` (or the
//! `encoding` query parameter of a Connect GET), against the protocols and
//! codecs a handler accepts.

use http::{HeaderMap, Method, header};
use rpcwire_core::codec::Codec;
use rpcwire_core::connect::{self, GetQuery};
use rpcwire_core::{Protocol, Spec, StreamType, grpc};

use crate::config::HandlerConfig;

/// How a matched request is framed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wire {
    /// Connect unary; `get` when the call arrived as an HTTP GET.
    ConnectUnary { get: bool },
    ConnectStream,
    Grpc { web: bool },
}

impl Wire {
    pub(crate) fn protocol(&self) -> Protocol {
        match self {
            Wire::ConnectUnary { .. } | Wire::ConnectStream => Protocol::Connect,
            Wire::Grpc { web: false } => Protocol::Grpc,
            Wire::Grpc { web: true } => Protocol::GrpcWeb,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Detected {
    pub wire: Wire,
    /// `None` only for a GET without an `encoding` parameter.
    pub codec: Option<Codec>,
    /// Codec name as the client spelled it, echoed in the response.
    pub codec_name: String,
}

/// Requests no protocol accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// 405, with the value of the `Allow` header.
    MethodNotAllowed(&'static str),
    /// 415, with the value of the `Accept-Post` header.
    UnsupportedMediaType(String),
}

pub(crate) fn detect(
    method: &Method,
    headers: &HeaderMap,
    query: Option<&str>,
    spec: &Spec,
    config: &HandlerConfig,
) -> Result<Detected, Rejection> {
    let allow = if spec.allows_get() { "GET, POST" } else { "POST" };
    if *method == Method::GET && spec.allows_get() {
        return detect_get(query, spec, config);
    }
    if *method != Method::POST {
        tracing::debug!(method = %method, "method not allowed");
        return Err(Rejection::MethodNotAllowed(allow));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let (wire, codec_name) = if content_type.starts_with(grpc::WEB_CONTENT_TYPE_DEFAULT) {
        (
            Wire::Grpc { web: true },
            grpc::codec_name_from_content_type(true, &content_type),
        )
    } else if content_type.starts_with(grpc::CONTENT_TYPE_DEFAULT) {
        (
            Wire::Grpc { web: false },
            grpc::codec_name_from_content_type(false, &content_type),
        )
    } else if spec.stream_type == StreamType::Unary
        && content_type.starts_with(connect::UNARY_CONTENT_TYPE_PREFIX)
        && !content_type.starts_with(connect::STREAMING_CONTENT_TYPE_PREFIX)
    {
        (
            Wire::ConnectUnary { get: false },
            connect::codec_name_from_content_type(StreamType::Unary, &content_type),
        )
    } else if spec.stream_type != StreamType::Unary
        && content_type.starts_with(connect::STREAMING_CONTENT_TYPE_PREFIX)
    {
        (
            Wire::ConnectStream,
            connect::codec_name_from_content_type(spec.stream_type, &content_type),
        )
    } else {
        return Err(unsupported(&content_type, spec, config));
    };
    let Some(codec) = config.codec(codec_name) else {
        return Err(unsupported(&content_type, spec, config));
    };
    Ok(Detected {
        wire,
        codec: Some(codec),
        codec_name: codec_name.to_string(),
    })
}

fn detect_get(query: Option<&str>, spec: &Spec, config: &HandlerConfig) -> Result<Detected, Rejection> {
    let query = GetQuery::parse(query.unwrap_or_default()).unwrap_or_default();
    let wire = Wire::ConnectUnary { get: true };
    let Some(encoding) = query.encoding.filter(|e| !e.is_empty()) else {
        return Ok(Detected {
            wire,
            codec: None,
            codec_name: config.default_codec().name().to_string(),
        });
    };
    match config.codec(&encoding) {
        Some(codec) => Ok(Detected {
            wire,
            codec: Some(codec),
            codec_name: encoding,
        }),
        None => Err(unsupported(
            &connect::content_type_from_codec_name(StreamType::Unary, &encoding),
            spec,
            config,
        )),
    }
}

fn unsupported(content_type: &str, spec: &Spec, config: &HandlerConfig) -> Rejection {
    tracing::debug!(content_type, procedure = %spec.procedure, "unsupported content type");
    Rejection::UnsupportedMediaType(accepted_content_types(spec, config).join(", "))
}

/// Every content type a handler for `spec` accepts, for `Accept-Post`.
pub(crate) fn accepted_content_types(spec: &Spec, config: &HandlerConfig) -> Vec<String> {
    let mut types = Vec::new();
    for codec in config.get_codecs() {
        types.push(connect::content_type_from_codec_name(
            spec.stream_type,
            codec.name(),
        ));
    }
    for web in [false, true] {
        for codec in config.get_codecs() {
            types.push(grpc::content_type_from_codec_name(web, codec.name()));
        }
    }
    types
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcwire_core::IdempotencyLevel;

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, content_type.parse().unwrap());
        headers
    }

    fn unary() -> Spec {
        Spec::new("/greet.v1.GreetService/Greet", StreamType::Unary)
    }

    #[test]
    fn test_detect_connect_unary_json_charset() {
        let config = HandlerConfig::default();
        let detected = detect(
            &Method::POST,
            &headers("application/json; charset=utf-8"),
            None,
            &unary(),
            &config,
        )
        .unwrap();
        assert_eq!(detected.wire, Wire::ConnectUnary { get: false });
        assert_eq!(detected.codec, Some(Codec::Json));
        assert_eq!(detected.codec_name, "json; charset=utf-8");
    }

    #[test]
    fn test_detect_grpc_variants() {
        let config = HandlerConfig::default();
        let spec = Spec::new("/svc/Chat", StreamType::BidiStream);
        let grpc = detect(&Method::POST, &headers("application/grpc"), None, &spec, &config).unwrap();
        assert_eq!(grpc.wire, Wire::Grpc { web: false });
        assert_eq!(grpc.codec, Some(Codec::Proto));

        let web = detect(
            &Method::POST,
            &headers("application/grpc-web+json"),
            None,
            &spec,
            &config,
        )
        .unwrap();
        assert_eq!(web.wire, Wire::Grpc { web: true });
        assert_eq!(web.wire.protocol(), Protocol::GrpcWeb);
        assert_eq!(web.codec, Some(Codec::Json));
    }

    #[test]
    fn test_streaming_content_type_rejected_for_unary() {
        let config = HandlerConfig::default();
        let err = detect(
            &Method::POST,
            &headers("application/connect+proto"),
            None,
            &unary(),
            &config,
        )
        .unwrap_err();
        let Rejection::UnsupportedMediaType(accept) = err else {
            panic!("expected 415");
        };
        assert!(accept.contains("application/proto"));
        assert!(accept.contains("application/grpc-web+json"));
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let config = HandlerConfig::default();
        let err = detect(&Method::POST, &headers("application/xml"), None, &unary(), &config);
        assert!(matches!(err, Err(Rejection::UnsupportedMediaType(_))));
    }

    #[test]
    fn test_get_requires_side_effect_free_procedure() {
        let config = HandlerConfig::default();
        let err = detect(&Method::GET, &HeaderMap::new(), Some("encoding=json"), &unary(), &config);
        assert_eq!(err, Err(Rejection::MethodNotAllowed("POST")));

        let spec = unary().with_idempotency(IdempotencyLevel::NoSideEffects);
        let detected = detect(
            &Method::GET,
            &HeaderMap::new(),
            Some("connect=v1&encoding=proto&base64=1&message=AA"),
            &spec,
            &config,
        )
        .unwrap();
        assert_eq!(detected.wire, Wire::ConnectUnary { get: true });
        assert_eq!(detected.codec, Some(Codec::Proto));

        let err = detect(&Method::PUT, &HeaderMap::new(), None, &spec, &config);
        assert_eq!(err, Err(Rejection::MethodNotAllowed("GET, POST")));
    }

    #[test]
    fn test_get_without_encoding_is_left_to_the_conn() {
        let config = HandlerConfig::default();
        let spec = unary().with_idempotency(IdempotencyLevel::NoSideEffects);
        let detected = detect(&Method::GET, &HeaderMap::new(), Some("message=abc"), &spec, &config).unwrap();
        assert_eq!(detected.codec, None);
    }
}
