//! One logical call as one HTTP request/response pair.
//!
//! Unary sends issue the request inline with a full body. Streaming sends
//! open a bounded pipe on first write; the request body reads the pipe and a
//! background task performs the request while the caller keeps writing.
//! Every read-side operation waits on a single-fire gate that carries the
//! response head or the terminal error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use hyper::body::Incoming;
use rpcwire_core::{CallContext, Error, Protocol, Spec, StreamType};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::Instrument;

use crate::transport::{HyperTransport, TransportBody};

const PIPE_CAPACITY: usize = 1;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The parts of a response every reader sees.
#[derive(Clone, Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

type Gate = Option<Result<ResponseHead, Error>>;

#[derive(Debug)]
struct RequestHead {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

pub(crate) struct DuplexCall {
    transport: HyperTransport,
    ctx: CallContext,
    spec: Spec,
    span: tracing::Span,
    started: AtomicBool,
    request: Mutex<RequestHead>,
    pipe: AsyncMutex<Option<mpsc::Sender<Bytes>>>,
    gate: Arc<watch::Sender<Gate>>,
    body: Arc<Mutex<Option<Incoming>>>,
}

impl std::fmt::Debug for DuplexCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexCall")
            .field("procedure", &self.spec.procedure)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DuplexCall {
    pub(crate) fn new(
        transport: HyperTransport,
        ctx: CallContext,
        spec: Spec,
        protocol: Protocol,
        uri: Uri,
        headers: HeaderMap,
    ) -> Self {
        let span = tracing::info_span!(
            "rpc",
            procedure = %spec.procedure,
            protocol = protocol.name(),
        );
        let (gate, _) = watch::channel(None);
        Self {
            transport,
            ctx,
            spec,
            span,
            started: AtomicBool::new(false),
            request: Mutex::new(RequestHead {
                method: Method::POST,
                uri,
                headers,
            }),
            pipe: AsyncMutex::new(None),
            gate: Arc::new(gate),
            body: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn spec(&self) -> &Spec {
        &self.spec
    }

    pub(crate) fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Headers of the request. Changes after the request started are lost.
    pub(crate) fn request_headers(&self) -> RequestHeaders<'_> {
        RequestHeaders(lock(&self.request))
    }

    pub(crate) fn method(&self) -> Method {
        lock(&self.request).method.clone()
    }

    pub(crate) fn uri(&self) -> Uri {
        lock(&self.request).uri.clone()
    }

    /// Turn the call into a GET of `uri`.
    pub(crate) fn use_get(&self, uri: Uri) {
        let mut request = lock(&self.request);
        request.method = Method::GET;
        request.uri = uri;
    }

    fn try_start(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn build_request(&self, body: TransportBody) -> Result<http::Request<TransportBody>, Error> {
        let head = {
            let mut request = lock(&self.request);
            RequestHead {
                method: request.method.clone(),
                uri: request.uri.clone(),
                headers: std::mem::take(&mut request.headers),
            }
        };
        let mut request = http::Request::builder()
            .method(head.method)
            .uri(head.uri)
            .body(body)
            .map_err(|e| Error::internal(format!("build request: {e}")))?;
        *request.headers_mut() = head.headers;
        Ok(request)
    }

    /// Issue the request inline with a complete body.
    pub(crate) async fn send_full(&self, body: TransportBody) -> Result<(), Error> {
        if !self.try_start() {
            return Err(Error::internal("request already sent"));
        }
        let request = self.build_request(body)?;
        let result = self
            .ctx
            .run(self.transport.request(request))
            .instrument(self.span.clone())
            .await;
        let failure = result.as_ref().err().cloned();
        publish(&self.gate, &self.body, &self.spec, result);
        failure.map_or(Ok(()), Err)
    }

    /// Write one chunk of a streaming request, starting it on first use.
    ///
    /// Returns `Ok(false)` when the transport stopped reading the body, which
    /// means the response already ended or failed.
    pub(crate) async fn write(&self, chunk: Bytes) -> Result<bool, Error> {
        let mut pipe = self.pipe.lock().await;
        if pipe.is_none() && self.try_start() {
            let (tx, rx) = mpsc::channel::<Bytes>(PIPE_CAPACITY);
            self.spawn_request(TransportBody::streaming(rx.map(Ok)))?;
            *pipe = Some(tx);
        }
        let Some(tx) = pipe.as_mut() else {
            return Err(Error::internal("request body already closed"));
        };
        self.ctx
            .run(async { Ok(tx.send(chunk).await.is_ok()) })
            .await
    }

    /// Half-close the request. With nothing written the request is still
    /// issued, with an empty body.
    pub(crate) async fn close_write(&self) -> Result<(), Error> {
        let mut pipe = self.pipe.lock().await;
        if let Some(mut tx) = pipe.take() {
            tx.close_channel();
            return Ok(());
        }
        if self.try_start() {
            self.spawn_request(TransportBody::empty())?;
        }
        Ok(())
    }

    fn spawn_request(&self, body: TransportBody) -> Result<(), Error> {
        let request = self.build_request(body)?;
        let transport = self.transport.clone();
        let ctx = self.ctx.clone();
        let gate = self.gate.clone();
        let slot = self.body.clone();
        let spec = self.spec.clone();
        tokio::spawn(
            async move {
                let result = ctx.run(transport.request(request)).await;
                if let Err(err) = &result {
                    tracing::debug!(error = %err, "request failed");
                }
                publish(&gate, &slot, &spec, result);
            }
            .instrument(self.span.clone()),
        );
        Ok(())
    }

    /// Wait for the response head. All callers observe the same outcome.
    pub(crate) async fn response_head(&self) -> Result<ResponseHead, Error> {
        let mut rx = self.gate.subscribe();
        self.ctx
            .run(async move {
                let gate = rx.wait_for(Option::is_some).await.map(|gate| gate.clone());
                match gate {
                    Ok(Some(outcome)) => outcome,
                    _ => Err(Error::internal("response was never delivered")),
                }
            })
            .await
    }

    /// Take the response body. Only the first caller gets it.
    pub(crate) fn take_body(&self) -> Option<Incoming> {
        lock(&self.body).take()
    }
}

/// Guard over the request headers of a call that has not started yet.
pub struct RequestHeaders<'a>(MutexGuard<'a, RequestHead>);

impl std::ops::Deref for RequestHeaders<'_> {
    type Target = HeaderMap;

    fn deref(&self) -> &HeaderMap {
        &self.0.headers
    }
}

impl std::ops::DerefMut for RequestHeaders<'_> {
    fn deref_mut(&mut self) -> &mut HeaderMap {
        &mut self.0.headers
    }
}

fn publish(
    gate: &watch::Sender<Gate>,
    slot: &Mutex<Option<Incoming>>,
    spec: &Spec,
    result: Result<http::Response<Incoming>, Error>,
) {
    let outcome = result.and_then(|response| {
        if spec.stream_type == StreamType::BidiStream && response.version() < Version::HTTP_2 {
            return Err(Error::unimplemented(
                "bidi streams require at least HTTP/2",
            ));
        }
        let (parts, body) = response.into_parts();
        *lock(slot) = Some(body);
        Ok(ResponseHead {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
        })
    });
    gate.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(outcome);
        true
    });
}
