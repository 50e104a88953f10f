#![allow(dead_code)]

use std::time::Duration;

use axum::Router;
use http::HeaderValue;
use rpcwire::{Handler, HandlerConfig, HandlerConn};
use rpcwire_client::{
    Client, ClientConfig, Codec, Error, HyperTransport, IdempotencyLevel, Protocol, Spec,
    StreamType,
};
use serde::{Deserialize, Serialize};

pub const ECHO: &str = "/test.v1.EchoService/Echo";
pub const REPEAT: &str = "/test.v1.EchoService/Repeat";
pub const COLLECT: &str = "/test.v1.EchoService/Collect";
pub const CHAT: &str = "/test.v1.EchoService/Chat";
pub const SLOW: &str = "/test.v1.EchoService/Slow";
pub const HANG: &str = "/test.v1.EchoService/Hang";

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct Ping {
    #[prost(string, tag = "1")]
    pub text: String,
}

pub fn ping(text: &str) -> Ping {
    Ping {
        text: text.to_string(),
    }
}

pub fn spec(procedure: &str, stream_type: StreamType) -> Spec {
    Spec::new(procedure, stream_type)
}

fn mark(conn: &HandlerConn) {
    conn.response_headers()
        .insert("x-handler", HeaderValue::from_static("echo"));
    conn.response_trailers()
        .insert("x-trailer", HeaderValue::from_static("done"));
}

fn fail_on(ping: &Ping) -> Result<(), Error> {
    if ping.text == "fail" {
        return Err(Error::failed_precondition("asked to fail"));
    }
    Ok(())
}

/// Echo procedures for every stream type, served with `config`.
pub fn router(config: HandlerConfig) -> Router {
    let echo = Handler::new(
        spec(ECHO, StreamType::Unary).with_idempotency(IdempotencyLevel::NoSideEffects),
        config.clone(),
        |conn: HandlerConn| async move {
            mark(&conn);
            let ping: Ping = conn.receive_unary().await?;
            fail_on(&ping)?;
            conn.send(&ping).await
        },
    );
    let repeat = Handler::new(
        spec(REPEAT, StreamType::ServerStream),
        config.clone(),
        |conn: HandlerConn| async move {
            mark(&conn);
            let ping: Ping = conn.receive_unary().await?;
            fail_on(&ping)?;
            let count = ping.text.len();
            for i in 0..count {
                conn.send(&Ping {
                    text: format!("{}-{i}", ping.text),
                })
                .await?;
            }
            Ok(())
        },
    );
    let collect = Handler::new(
        spec(COLLECT, StreamType::ClientStream),
        config.clone(),
        |conn: HandlerConn| async move {
            mark(&conn);
            let mut texts = Vec::new();
            while let Some(ping) = conn.receive::<Ping>().await? {
                fail_on(&ping)?;
                texts.push(ping.text);
            }
            conn.send(&Ping {
                text: texts.join(","),
            })
            .await
        },
    );
    let chat = Handler::new(
        spec(CHAT, StreamType::BidiStream),
        config.clone(),
        |conn: HandlerConn| async move {
            mark(&conn);
            while let Some(ping) = conn.receive::<Ping>().await? {
                fail_on(&ping)?;
                conn.send(&ping).await?;
            }
            Ok(())
        },
    );
    let slow = Handler::new(
        spec(SLOW, StreamType::Unary),
        config.clone(),
        |conn: HandlerConn| async move {
            let ping: Ping = conn.receive_unary().await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            conn.send(&ping).await
        },
    );
    let hang = Handler::new(
        spec(HANG, StreamType::BidiStream),
        config,
        |conn: HandlerConn| async move {
            let _ = conn.receive::<Ping>().await?;
            std::future::pending::<()>().await;
            Ok(())
        },
    );
    Router::new()
        .route_service(ECHO, echo)
        .route_service(REPEAT, repeat)
        .route_service(COLLECT, collect)
        .route_service(CHAT, chat)
        .route_service(SLOW, slow)
        .route_service(HANG, hang)
}

/// Serve `router` on a loopback port and return its base URL.
pub async fn serve(router: Router) -> String {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn client(base_url: &str, config: ClientConfig) -> Client {
    let transport = HyperTransport::builder().http2_only(true).build().unwrap();
    Client::new(base_url, transport, config).unwrap()
}

/// Every protocol with every codec.
pub fn matrix() -> Vec<ClientConfig> {
    let mut configs = Vec::new();
    for protocol in [Protocol::Connect, Protocol::Grpc, Protocol::GrpcWeb] {
        for codec in [Codec::Proto, Codec::Json] {
            configs.push(ClientConfig::new(protocol).codec(codec));
        }
    }
    configs
}

pub fn label(config: &ClientConfig) -> String {
    format!("{}+{}", config.get_protocol(), config.get_codec().name())
}
