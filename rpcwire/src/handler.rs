//! The [`Handler`] service.
//!
//! A `Handler` serves one procedure over Connect, gRPC and gRPC-Web. It is a
//! `tower::Service`, so it mounts directly on an axum router:
//!
//! ```rust,ignore
//! let spec = Spec::new("/greet.v1.GreetService/Greet", StreamType::Unary);
//! let handler = Handler::new(spec, HandlerConfig::default(), |conn: HandlerConn| async move {
//!     let request: GreetRequest = conn.receive_unary().await?;
//!     conn.send(&GreetResponse { greeting: format!("Hello, {}!", request.name) }).await
//! });
//! let app = Router::new().route_service("/greet.v1.GreetService/Greet", handler);
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::Response;
use http::{HeaderValue, Request, StatusCode, header};
use rpcwire_core::{Error, Spec};
use tokio::sync::oneshot;
use tower::Service;
use tracing::Instrument;

use crate::body;
use crate::config::HandlerConfig;
use crate::conn::HandlerConn;
use crate::sniff::{self, Rejection, Wire};
use crate::{connect, grpc};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Application logic of one procedure.
///
/// Returning an error ends the call with that error; returning `Ok` ends it
/// successfully. Either way the protocol's end of stream is written after
/// the implementation returns.
pub trait Implementation: Send + Sync + 'static {
    fn call(&self, conn: HandlerConn) -> BoxFuture<Result<(), Error>>;
}

impl<F, Fut> Implementation for F
where
    F: Fn(HandlerConn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn call(&self, conn: HandlerConn) -> BoxFuture<Result<(), Error>> {
        Box::pin(self(conn))
    }
}

/// Serves one procedure over every supported protocol.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<Inner>,
}

struct Inner {
    spec: Spec,
    config: HandlerConfig,
    implementation: Box<dyn Implementation>,
}

impl Handler {
    pub fn new<I: Implementation>(spec: Spec, config: HandlerConfig, implementation: I) -> Self {
        Self {
            inner: Arc::new(Inner {
                spec,
                config,
                implementation: Box::new(implementation),
            }),
        }
    }

    pub fn spec(&self) -> &Spec {
        &self.inner.spec
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.inner.config
    }
}

impl Inner {
    async fn serve(self: Arc<Self>, req: Request<Body>) -> Response {
        let (parts, request_body) = req.into_parts();
        let detected = match sniff::detect(
            &parts.method,
            &parts.headers,
            parts.uri.query(),
            &self.spec,
            &self.config,
        ) {
            Ok(detected) => detected,
            Err(rejection) => return rejection_response(rejection),
        };

        let (head_tx, head_rx) = oneshot::channel();
        let (sink, response_body) = body::channel();
        let (conn, failure) = match detected.wire {
            Wire::Grpc { .. } => grpc::new_conn(
                &detected,
                &parts,
                request_body,
                &self.config,
                &self.spec,
                head_tx,
                sink,
            ),
            Wire::ConnectUnary { .. } | Wire::ConnectStream => connect::new_conn(
                &detected,
                &parts,
                request_body,
                &self.config,
                &self.spec,
                head_tx,
                sink,
            ),
        };

        let span = tracing::debug_span!(
            "rpc",
            procedure = %self.spec.procedure,
            protocol = %conn.protocol(),
        );
        match failure {
            Some(err) => {
                tracing::debug!(parent: &span, error = %err, "rejecting call");
                conn.close(Some(err)).instrument(span).await;
            }
            None => {
                let inner = self.clone();
                tokio::spawn(
                    async move {
                        let result = conn
                            .context()
                            .run(inner.implementation.call(conn.clone()))
                            .await;
                        if let Err(err) = &result {
                            tracing::debug!(error = %err, "call failed");
                        }
                        conn.close(result.err()).await;
                    }
                    .instrument(span),
                );
            }
        }

        match head_rx.await {
            Ok(head) => head.map(|()| response_body),
            Err(_) => {
                tracing::debug!(procedure = %self.spec.procedure, "call ended without a response");
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}

fn rejection_response(rejection: Rejection) -> Response {
    let mut response = Response::new(Body::empty());
    match rejection {
        Rejection::MethodNotAllowed(allow) => {
            *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(allow));
        }
        Rejection::UnsupportedMediaType(accept) => {
            *response.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
            if let Ok(accept) = HeaderValue::from_str(&accept) {
                response.headers_mut().insert("accept-post", accept);
            }
        }
    }
    response
}

impl Service<Request<Body>> for Handler {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.serve(req).await) })
    }
}
