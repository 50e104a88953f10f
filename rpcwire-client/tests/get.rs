mod common;

use std::sync::{Arc, Mutex};

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use common::*;
use http::Method;
use rpcwire::HandlerConfig;
use rpcwire_client::{
    CallContext, ClientConfig, Code, Codec, IdempotencyLevel, Protocol, Spec, StreamType,
};

type Seen = Arc<Mutex<Vec<(Method, String)>>>;

async fn record(State(seen): State<Seen>, request: Request, next: Next) -> Response {
    let query = request.uri().query().unwrap_or_default().to_string();
    seen.lock().unwrap().push((request.method().clone(), query));
    next.run(request).await
}

async fn serve_recording() -> (String, Seen) {
    let seen = Seen::default();
    let router = router(HandlerConfig::default())
        .layer(middleware::from_fn_with_state(seen.clone(), record));
    (serve(router).await, seen)
}

fn idempotent() -> Spec {
    spec(ECHO, StreamType::Unary).with_idempotency(IdempotencyLevel::NoSideEffects)
}

fn get_config() -> ClientConfig {
    ClientConfig::new(Protocol::Connect).enable_get(true)
}

fn last(seen: &Seen) -> (Method, String) {
    seen.lock().unwrap().last().cloned().unwrap()
}

#[tokio::test]
async fn test_json_get() {
    let (base, seen) = serve_recording().await;
    let client = client(&base, get_config().codec(Codec::Json));
    let reply: Ping = client
        .unary(idempotent(), CallContext::new(), &ping("hi"))
        .await
        .unwrap();
    assert_eq!(reply.text, "hi");
    let (method, query) = last(&seen);
    assert_eq!(method, Method::GET);
    assert!(query.starts_with("connect=v1&encoding=json"), "{query}");
    assert!(!query.contains("base64"), "{query}");
}

#[tokio::test]
async fn test_proto_get_is_base64() {
    let (base, seen) = serve_recording().await;
    let client = client(&base, get_config());
    let reply: Ping = client
        .unary(idempotent(), CallContext::new(), &ping("hi"))
        .await
        .unwrap();
    assert_eq!(reply.text, "hi");
    let (method, query) = last(&seen);
    assert_eq!(method, Method::GET);
    assert!(query.contains("encoding=proto"), "{query}");
    assert!(query.contains("base64=1"), "{query}");
}

#[tokio::test]
async fn test_side_effects_use_post() {
    let (base, seen) = serve_recording().await;
    let client = client(&base, get_config());
    let _: Ping = client
        .unary(spec(ECHO, StreamType::Unary), CallContext::new(), &ping("hi"))
        .await
        .unwrap();
    assert_eq!(last(&seen).0, Method::POST);
}

#[tokio::test]
async fn test_get_disabled_uses_post() {
    let (base, seen) = serve_recording().await;
    let client = client(&base, ClientConfig::new(Protocol::Connect));
    let _: Ping = client
        .unary(idempotent(), CallContext::new(), &ping("hi"))
        .await
        .unwrap();
    assert_eq!(last(&seen).0, Method::POST);
}

#[tokio::test]
async fn test_oversized_url_falls_back_to_post() {
    let (base, seen) = serve_recording().await;
    let client = client(&base, get_config().get_url_max_bytes(32));
    let reply: Ping = client
        .unary(idempotent(), CallContext::new(), &ping("hi"))
        .await
        .unwrap();
    assert_eq!(reply.text, "hi");
    assert_eq!(last(&seen).0, Method::POST);
}

#[tokio::test]
async fn test_oversized_url_without_fallback() {
    let (base, seen) = serve_recording().await;
    let client = client(
        &base,
        get_config().get_url_max_bytes(32).get_use_fallback(false),
    );
    let err = client
        .unary::<Ping, Ping>(idempotent(), CallContext::new(), &ping("hi"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert!(err.message().starts_with("url size "), "{err}");
    assert!(
        err.message()
            .ends_with("exceeds getURLMaxBytes 32: enabling request compression may help"),
        "{err}"
    );
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_compressed_url_fits() {
    let (base, seen) = serve_recording().await;
    let client = client(
        &base,
        get_config()
            .send_compression("gzip")
            .get_url_max_bytes(600)
            .get_use_fallback(false),
    );
    let text = "a".repeat(2000);
    let reply: Ping = client
        .unary(idempotent(), CallContext::new(), &ping(&text))
        .await
        .unwrap();
    assert_eq!(reply.text, text);
    let (method, query) = last(&seen);
    assert_eq!(method, Method::GET);
    assert!(query.contains("compression=gzip"), "{query}");
    assert!(query.contains("base64=1"), "{query}");
}

#[tokio::test]
async fn test_compressed_url_ignores_compress_min_bytes() {
    let (base, seen) = serve_recording().await;
    let client = client(
        &base,
        get_config()
            .codec(Codec::Json)
            .send_compression("gzip")
            .compress_min_bytes(4096)
            .get_url_max_bytes(400)
            .get_use_fallback(false),
    );
    let text = "a".repeat(2000);
    let reply: Ping = client
        .unary(idempotent(), CallContext::new(), &ping(&text))
        .await
        .unwrap();
    assert_eq!(reply.text, text);
    let (method, query) = last(&seen);
    assert_eq!(method, Method::GET);
    assert!(query.contains("compression=gzip"), "{query}");
}

#[tokio::test]
async fn test_compressed_url_still_too_long() {
    let (base, seen) = serve_recording().await;
    let client = client(
        &base,
        get_config()
            .send_compression("gzip")
            .get_url_max_bytes(20)
            .get_use_fallback(false),
    );
    let err = client
        .unary::<Ping, Ping>(idempotent(), CallContext::new(), &ping(&"a".repeat(2000)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert!(err.message().starts_with("compressed url size "), "{err}");
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_message_over_send_limit_without_compression() {
    let (base, seen) = serve_recording().await;
    let client = client(&base, get_config().send_max_bytes(10));
    let err = client
        .unary::<Ping, Ping>(idempotent(), CallContext::new(), &ping(&"a".repeat(100)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert!(
        err.message().ends_with("enabling request compression may help"),
        "{err}"
    );
    assert!(seen.lock().unwrap().is_empty());
}
