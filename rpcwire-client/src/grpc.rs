//! gRPC and gRPC-Web client specifics.

use http::{HeaderMap, HeaderValue, header};
use rpcwire_core::grpc::{self, TrailerStatus};
use rpcwire_core::protocol::{HEADER_X_USER_AGENT, merge_headers};
use rpcwire_core::{CallContext, Envelope, Error, envelope_flags};

use crate::config::ClientConfig;

pub(crate) fn request_headers(config: &ClientConfig, web: bool, ctx: &CallContext) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(content_type) =
        HeaderValue::from_str(&grpc::content_type_from_codec_name(web, config.codec.name()))
    {
        headers.insert(header::CONTENT_TYPE, content_type);
    }
    if let Ok(user_agent) = HeaderValue::from_str(&config.user_agent_value()) {
        if web {
            headers.insert(HEADER_X_USER_AGENT, user_agent.clone());
        }
        headers.insert(header::USER_AGENT, user_agent);
    }
    if !web {
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    }
    if let Some(timeout) = ctx.remaining() {
        if let Ok(timeout) = HeaderValue::from_str(&grpc::encode_timeout(timeout)) {
            headers.insert(grpc::HEADER_TIMEOUT, timeout);
        }
    }
    if let Some(name) = &config.send_compression {
        if let Ok(name) = HeaderValue::from_str(name) {
            headers.insert(grpc::HEADER_COMPRESSION, name);
        }
    }
    if !config.compression.is_empty() {
        if let Ok(names) = HeaderValue::from_str(&config.compression.comma_separated_names()) {
            headers.insert(grpc::HEADER_ACCEPT_COMPRESSION, names);
        }
    }
    headers
}

/// Trailers carried by a gRPC-Web trailer frame.
pub(crate) fn web_trailers(envelope: &Envelope) -> Result<HeaderMap, Error> {
    if !envelope.is_set(envelope_flags::TRAILER) {
        return Err(Error::internal(format!(
            "protocol error: invalid envelope flags {}",
            envelope.flags
        )));
    }
    grpc::decode_web_trailers(&envelope.data)
}

/// The final status of a call.
///
/// When the trailers carry no status at all, the headers are tried before
/// giving up.
pub(crate) fn final_status(headers: &HeaderMap, trailers: &HeaderMap) -> Option<Error> {
    let status = match grpc::status_from_trailers(trailers) {
        TrailerStatus::Missing(missing) => match grpc::status_from_trailers(headers) {
            TrailerStatus::Missing(_) => TrailerStatus::Error(missing),
            found => found,
        },
        found => found,
    };
    match status {
        TrailerStatus::Ok => None,
        TrailerStatus::Error(err) | TrailerStatus::Missing(err) => {
            let mut meta = headers.clone();
            merge_headers(&mut meta, trailers);
            Some(err.with_meta(meta))
        }
    }
}

/// A response carrying its status in the headers.
pub(crate) fn is_trailers_only(headers: &HeaderMap) -> bool {
    headers.contains_key(grpc::HEADER_STATUS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcwire_core::{Code, Protocol};
    use std::time::Duration;

    #[test]
    fn test_grpc_headers() {
        let config = ClientConfig::new(Protocol::Grpc).send_compression("gzip");
        let ctx = CallContext::new().with_timeout(Duration::from_secs(3));
        let headers = request_headers(&config, false, &ctx);
        assert_eq!(headers[header::CONTENT_TYPE], "application/grpc");
        assert_eq!(headers[header::TE], "trailers");
        assert_eq!(headers[header::ACCEPT_ENCODING], "identity");
        assert_eq!(headers[grpc::HEADER_COMPRESSION], "gzip");
        assert_eq!(headers[grpc::HEADER_ACCEPT_COMPRESSION], "gzip");
        assert!(headers[grpc::HEADER_TIMEOUT].to_str().unwrap().ends_with('u'));
        assert!(headers.get(HEADER_X_USER_AGENT).is_none());
    }

    #[test]
    fn test_grpc_web_headers() {
        let config = ClientConfig::new(Protocol::GrpcWeb).codec(rpcwire_core::Codec::Json);
        let headers = request_headers(&config, true, &CallContext::new());
        assert_eq!(headers[header::CONTENT_TYPE], "application/grpc-web+json");
        assert!(headers.get(header::TE).is_none());
        assert_eq!(headers[HEADER_X_USER_AGENT], headers[header::USER_AGENT]);
        assert!(headers.get(grpc::HEADER_TIMEOUT).is_none());
    }

    #[test]
    fn test_final_status_prefers_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert(grpc::HEADER_STATUS, HeaderValue::from_static("0"));
        assert!(final_status(&HeaderMap::new(), &trailers).is_none());

        trailers.insert(grpc::HEADER_STATUS, HeaderValue::from_static("7"));
        trailers.insert(grpc::HEADER_MESSAGE, HeaderValue::from_static("go%20away"));
        trailers.insert("x-why", HeaderValue::from_static("policy"));
        let err = final_status(&HeaderMap::new(), &trailers).unwrap();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(err.message(), "go away");
        assert_eq!(err.meta()["x-why"], "policy");
    }

    #[test]
    fn test_final_status_falls_back_to_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(grpc::HEADER_STATUS, HeaderValue::from_static("5"));
        let err = final_status(&headers, &HeaderMap::new()).unwrap();
        assert_eq!(err.code(), Code::NotFound);

        let err = final_status(&HeaderMap::new(), &HeaderMap::new()).unwrap();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn test_web_trailer_frame() {
        let data = bytes::Bytes::from_static(b"grpc-status: 0\r\nx-done: yes\r\n");
        let trailers = web_trailers(&Envelope::new(envelope_flags::TRAILER, data)).unwrap();
        assert_eq!(trailers["x-done"], "yes");
        let err = web_trailers(&Envelope::new(envelope_flags::END_STREAM, Default::default()))
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }
}
