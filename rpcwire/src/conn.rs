//! The handler side of one call.
//!
//! A [`HandlerConn`] is created per inbound request by the matching protocol
//! and handed to the implementation. Response headers go out lazily, with
//! the first message; the end of the call (trailers, end-stream frame or
//! error body) is written by [`HandlerConn::close`] once the implementation
//! returns.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::SinkExt;
use http::header::{self, AsHeaderName};
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use rpcwire_core::connect::{EndStreamMessage, UNARY_TRAILER_PREFIX, WireError};
use rpcwire_core::envelope::{Envelope, EnvelopeReader, EnvelopeWriter, Next, envelope_flags};
use rpcwire_core::protocol::{merge_headers, merge_non_protocol_headers};
use rpcwire_core::{
    CallContext, Error, Protocol, RpcMessage, Spec, UnaryReader, UnaryWriter, grpc,
    unary_cardinality_error,
};
use tokio::sync::{Mutex as AsyncMutex, oneshot};

use crate::body::{BodySink, RequestStream};
use crate::sniff::Wire;

/// Delivers the response head to the service future.
pub(crate) type HeadSender = oneshot::Sender<Response<()>>;

pub(crate) fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One inbound call.
///
/// Clones share the call. A send may run concurrently with a receive;
/// concurrent sends (or receives) are serialized.
#[derive(Clone)]
pub struct HandlerConn {
    shared: Arc<Shared>,
}

struct Shared {
    spec: Spec,
    wire: Wire,
    request_headers: HeaderMap,
    ctx: CallContext,
    response_headers: Mutex<HeaderMap>,
    response_trailers: Mutex<HeaderMap>,
    reader: AsyncMutex<Reader>,
    writer: AsyncMutex<Writer>,
}

impl HandlerConn {
    pub(crate) fn new(
        spec: Spec,
        wire: Wire,
        request_headers: HeaderMap,
        ctx: CallContext,
        reader: Reader,
        writer: Writer,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                spec,
                wire,
                request_headers,
                ctx,
                response_headers: Mutex::new(HeaderMap::new()),
                response_trailers: Mutex::new(HeaderMap::new()),
                reader: AsyncMutex::new(reader),
                writer: AsyncMutex::new(writer),
            }),
        }
    }

    pub fn spec(&self) -> &Spec {
        &self.shared.spec
    }

    pub fn protocol(&self) -> Protocol {
        self.shared.wire.protocol()
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.shared.request_headers
    }

    /// Deadline of the call, derived from the request's timeout header.
    pub fn context(&self) -> &CallContext {
        &self.shared.ctx
    }

    /// Headers sent with the response head. Changes after the first
    /// message has been sent have no effect.
    pub fn response_headers(&self) -> MutexGuard<'_, HeaderMap> {
        lock(&self.shared.response_headers)
    }

    /// Trailers sent when the call ends.
    ///
    /// Connect unary responses carry them as `Trailer-` prefixed headers, so
    /// they must be set before the response message is sent.
    pub fn response_trailers(&self) -> MutexGuard<'_, HeaderMap> {
        lock(&self.shared.response_trailers)
    }

    /// Next request message, or `None` once the client finished sending.
    pub async fn receive<M: RpcMessage>(&self) -> Result<Option<M>, Error> {
        let shared = &*self.shared;
        let mut reader = shared.reader.lock().await;
        shared.ctx.run(reader.next::<M>()).await
    }

    /// The single message of a unary request.
    pub async fn receive_unary<M: RpcMessage>(&self) -> Result<M, Error> {
        let Some(message) = self.receive::<M>().await? else {
            return Err(unary_cardinality_error("request", true));
        };
        if self.receive::<M>().await?.is_some() {
            return Err(unary_cardinality_error("request", false));
        }
        Ok(message)
    }

    /// Send a response message. The first send also sends the response head.
    pub async fn send<M: RpcMessage>(&self, message: &M) -> Result<(), Error> {
        let shared = &*self.shared;
        let mut writer = shared.writer.lock().await;
        shared.ctx.run(writer.send(shared, message)).await
    }

    /// Finish the response with the outcome of the call. Only the first
    /// close has an effect.
    pub(crate) async fn close(&self, err: Option<Error>) {
        let shared = &*self.shared;
        let mut writer = shared.writer.lock().await;
        writer.close(shared, err).await;
    }
}

impl fmt::Debug for HandlerConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerConn")
            .field("procedure", &self.shared.spec.procedure)
            .field("protocol", &self.protocol())
            .finish_non_exhaustive()
    }
}

/// Read side of a call.
pub(crate) enum Reader {
    /// Connect unary: the whole body (or GET query) is one message.
    Unary {
        stream: RequestStream,
        reader: UnaryReader,
        done: bool,
    },
    Envelope {
        reader: EnvelopeReader<RequestStream>,
        done: bool,
    },
}

impl Reader {
    async fn next<M: RpcMessage>(&mut self) -> Result<Option<M>, Error> {
        match self {
            Reader::Unary {
                stream,
                reader,
                done,
            } => {
                if *done {
                    return Ok(None);
                }
                *done = true;
                reader.read(stream).await.map(Some)
            }
            Reader::Envelope { reader, done } => {
                if *done {
                    return Ok(None);
                }
                match reader.unmarshal::<M>().await? {
                    Next::Message(message) => Ok(Some(message)),
                    Next::End => {
                        *done = true;
                        Ok(None)
                    }
                    Next::Special(envelope) => {
                        *done = true;
                        Err(Error::invalid_argument(format!(
                            "protocol error: unexpected frame with flags {:#04x} in request",
                            envelope.flags
                        )))
                    }
                }
            }
        }
    }
}

/// How response messages are framed.
pub(crate) enum Framing {
    Unary(UnaryWriter),
    Envelope(EnvelopeWriter),
}

/// Write side of a call.
pub(crate) struct Writer {
    head: Option<HeadSender>,
    base_headers: HeaderMap,
    sink: BodySink,
    framing: Framing,
    sent: bool,
    closed: bool,
}

impl Writer {
    pub(crate) fn new(
        head: HeadSender,
        base_headers: HeaderMap,
        sink: BodySink,
        framing: Framing,
    ) -> Self {
        Self {
            head: Some(head),
            base_headers,
            sink,
            framing,
            sent: false,
            closed: false,
        }
    }

    fn head_headers(&self, shared: &Shared) -> HeaderMap {
        let mut headers = self.base_headers.clone();
        merge_headers(&mut headers, &lock(&shared.response_headers));
        headers
    }

    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) {
        let Some(tx) = self.head.take() else {
            return;
        };
        let mut head = Response::new(());
        *head.status_mut() = status;
        *head.headers_mut() = headers;
        if tx.send(head).is_err() {
            tracing::debug!("response head dropped by the server");
        }
    }

    fn ensure_head(&mut self, shared: &Shared) {
        if self.head.is_some() {
            let headers = self.head_headers(shared);
            self.send_head(StatusCode::OK, headers);
        }
    }

    async fn send<M: RpcMessage>(&mut self, shared: &Shared, message: &M) -> Result<(), Error> {
        if self.closed {
            return Err(Error::internal("send after the call was closed"));
        }
        if let Framing::Envelope(_) = self.framing {
            self.ensure_head(shared);
        }
        match &self.framing {
            Framing::Unary(writer) => {
                if self.sent {
                    return Err(unary_cardinality_error("response", false));
                }
                let payload = writer.marshal(message)?;
                self.sent = true;
                let mut headers = self.head_headers(shared);
                if let Some(name) = &payload.compression {
                    if let Ok(value) = HeaderValue::from_str(name) {
                        headers.insert(header::CONTENT_ENCODING, value);
                    }
                }
                append_unary_trailers(&mut headers, &lock(&shared.response_trailers));
                self.send_head(StatusCode::OK, headers);
                if !payload.data.is_empty() {
                    self.sink.send(payload.data).await?;
                }
                Ok(())
            }
            Framing::Envelope(writer) => {
                self.sent = true;
                writer.marshal(&mut self.sink, message).await
            }
        }
    }

    async fn close(&mut self, shared: &Shared, err: Option<Error>) {
        if self.closed {
            return;
        }
        self.closed = true;
        let result = match shared.wire {
            Wire::ConnectUnary { .. } => self.close_connect_unary(shared, err).await,
            Wire::ConnectStream => self.close_connect_stream(shared, err).await,
            Wire::Grpc { web } => self.close_grpc(shared, web, err).await,
        };
        if let Err(err) = result {
            tracing::debug!(error = %err, procedure = %shared.spec.procedure, "failed to end response");
        }
        self.sink.finish();
    }

    async fn close_connect_unary(&mut self, shared: &Shared, err: Option<Error>) -> Result<(), Error> {
        if self.sent {
            if let Some(err) = err {
                tracing::debug!(error = %err, "error after the unary response was sent");
            }
            return Ok(());
        }
        let err = err.unwrap_or_else(|| unary_cardinality_error("response", true));
        let mut headers = self.head_headers(shared);
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if !err.is_wire() {
            merge_non_protocol_headers(&mut headers, err.meta());
        }
        append_unary_trailers(&mut headers, &lock(&shared.response_trailers));
        let body = serde_json::to_vec(&WireError::from_error(&err))
            .map_err(|e| Error::internal(format!("marshal error: {e}")))?;
        self.send_head(err.code().to_http_status(), headers);
        self.sink.send(Bytes::from(body)).await
    }

    async fn close_connect_stream(&mut self, shared: &Shared, err: Option<Error>) -> Result<(), Error> {
        self.ensure_head(shared);
        let mut trailers = lock(&shared.response_trailers).clone();
        if let Some(err) = err.as_ref().filter(|err| !err.is_wire()) {
            merge_non_protocol_headers(&mut trailers, err.meta());
        }
        let end = EndStreamMessage::new(err.as_ref(), &trailers);
        let data = serde_json::to_vec(&end)
            .map_err(|e| Error::internal(format!("marshal end stream: {e}")))?;
        let Framing::Envelope(writer) = &self.framing else {
            return Ok(());
        };
        writer
            .write(
                &mut self.sink,
                Envelope::new(envelope_flags::END_STREAM, Bytes::from(data)),
            )
            .await
    }

    async fn close_grpc(&mut self, shared: &Shared, web: bool, err: Option<Error>) -> Result<(), Error> {
        let mut trailers = lock(&shared.response_trailers).clone();
        grpc::error_to_trailers(&mut trailers, err.as_ref());
        if self.head.is_some() {
            // Trailers-only: nothing went into the body.
            let mut headers = self.head_headers(shared);
            merge_headers(&mut headers, &trailers);
            self.send_head(StatusCode::OK, headers);
            return Ok(());
        }
        if !web {
            return self.sink.send_trailers(trailers).await;
        }
        let Framing::Envelope(writer) = &self.framing else {
            return Ok(());
        };
        writer
            .write(
                &mut self.sink,
                Envelope::new(envelope_flags::TRAILER, grpc::encode_web_trailers(&trailers)),
            )
            .await
    }
}

/// Connect unary responses carry trailers as prefixed headers.
fn append_unary_trailers(headers: &mut HeaderMap, trailers: &HeaderMap) {
    for (name, value) in trailers {
        let prefixed = format!("{UNARY_TRAILER_PREFIX}{name}");
        if let Ok(prefixed) = HeaderName::from_bytes(prefixed.as_bytes()) {
            headers.append(prefixed, value.clone());
        }
    }
}
