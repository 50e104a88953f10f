//! Client conns: one send/receive contract over a duplex call, whatever the
//! protocol.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Sink;
use http::header::AsHeaderName;
use http::{HeaderMap, HeaderValue, StatusCode, Uri, header};
use hyper::body::Incoming;
use rpcwire_core::compression::COMPRESSION_IDENTITY;
use rpcwire_core::protocol::merge_headers;
use rpcwire_core::{
    BodyStream, BufferPool, CallContext, Code, CompressionPool, EnvelopeReader, EnvelopeWriter,
    Error, Next, Protocol, RpcMessage, Spec, StreamType, UnaryReader, UnaryWriter, connect as wire,
    grpc as grpc_wire, unary_cardinality_error,
};
use tokio::sync::Mutex as AsyncMutex;

use crate::classify::{classify_body, with_protocol_hint};
use crate::config::ClientConfig;
use crate::connect::{self, UnaryRequest};
use crate::duplex::{DuplexCall, RequestHeaders};
use crate::grpc;
use crate::transport::{HyperTransport, TransportBody};

type ResponseStream = BodyStream<Incoming>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn header_str<K: AsHeaderName>(headers: &HeaderMap, name: K) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wire {
    ConnectUnary,
    ConnectStream,
    Grpc { web: bool },
}

/// Collects the chunks of one marshaled envelope.
#[derive(Default)]
struct Frames(Vec<Bytes>);

impl Sink<Bytes> for Frames {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Error> {
        self.0.push(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        Poll::Ready(Ok(()))
    }
}

enum Framing {
    Unary(UnaryWriter),
    Envelope(EnvelopeWriter),
}

struct Sender {
    framing: Framing,
    sent: bool,
}

enum Receiver {
    Pending,
    Unary {
        stream: ResponseStream,
        reader: UnaryReader,
        done: bool,
    },
    Envelope {
        reader: EnvelopeReader<ResponseStream>,
    },
    Done(Option<Error>),
}

enum Step<M> {
    Message(M),
    Finished(Option<Error>),
}

struct Shared {
    duplex: DuplexCall,
    wire: Wire,
    config: Arc<ClientConfig>,
    buffers: BufferPool,
    use_get: bool,
    sender: AsyncMutex<Sender>,
    receiver: AsyncMutex<Receiver>,
    response_headers: Mutex<HeaderMap>,
    response_trailers: Mutex<HeaderMap>,
}

/// The client end of one call.
///
/// Send-family and receive-family methods may run concurrently with each
/// other; two concurrent sends, or two concurrent receives, are serialized.
#[derive(Clone)]
pub struct ClientConn {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("protocol", &self.protocol())
            .field("duplex", &self.shared.duplex)
            .finish_non_exhaustive()
    }
}

impl ClientConn {
    pub(crate) fn new(
        transport: HyperTransport,
        config: Arc<ClientConfig>,
        buffers: BufferPool,
        spec: Spec,
        ctx: CallContext,
        uri: Uri,
    ) -> Self {
        let wire = match config.protocol {
            Protocol::Connect if spec.stream_type == StreamType::Unary => Wire::ConnectUnary,
            Protocol::Connect => Wire::ConnectStream,
            Protocol::Grpc => Wire::Grpc { web: false },
            Protocol::GrpcWeb => Wire::Grpc { web: true },
        };
        let headers = match wire {
            Wire::ConnectUnary | Wire::ConnectStream => {
                connect::request_headers(&config, spec.stream_type, &ctx)
            }
            Wire::Grpc { web } => grpc::request_headers(&config, web, &ctx),
        };
        let send_pool = config
            .send_compression
            .as_deref()
            .and_then(|name| config.compression.get(name))
            .cloned();
        let framing = match wire {
            Wire::ConnectUnary => Framing::Unary(
                UnaryWriter::new(config.codec, buffers.clone())
                    .compression(send_pool)
                    .compress_min_bytes(config.compress_min_bytes)
                    .send_max_bytes(config.send_max_bytes),
            ),
            _ => Framing::Envelope(
                EnvelopeWriter::new(config.codec, buffers.clone())
                    .compression(send_pool)
                    .compress_min_bytes(config.compress_min_bytes)
                    .send_max_bytes(config.send_max_bytes),
            ),
        };
        let use_get = wire == Wire::ConnectUnary && config.enable_get && spec.allows_get();
        let duplex = DuplexCall::new(transport, ctx, spec, config.protocol, uri, headers);
        Self {
            shared: Arc::new(Shared {
                duplex,
                wire,
                config,
                buffers,
                use_get,
                sender: AsyncMutex::new(Sender {
                    framing,
                    sent: false,
                }),
                receiver: AsyncMutex::new(Receiver::Pending),
                response_headers: Mutex::new(HeaderMap::new()),
                response_trailers: Mutex::new(HeaderMap::new()),
            }),
        }
    }

    pub fn spec(&self) -> &Spec {
        self.shared.duplex.spec()
    }

    pub fn protocol(&self) -> Protocol {
        self.shared.config.protocol
    }

    pub fn context(&self) -> &CallContext {
        self.shared.duplex.context()
    }

    /// Request metadata. Only effective before the first send.
    pub fn request_headers(&self) -> RequestHeaders<'_> {
        self.shared.duplex.request_headers()
    }

    /// Send one message. The first send issues the request.
    pub async fn send<M: RpcMessage>(&self, message: &M) -> Result<(), Error> {
        self.context().run(self.send_message(message)).await
    }

    async fn send_message<M: RpcMessage>(&self, message: &M) -> Result<(), Error> {
        let shared = &*self.shared;
        let mut sender = shared.sender.lock().await;
        if sender.sent && !self.spec().stream_type.is_client_stream() {
            return Err(match shared.wire {
                Wire::ConnectUnary => Error::internal("request already sent"),
                _ => unary_cardinality_error("request", false),
            });
        }
        sender.sent = true;
        match &sender.framing {
            Framing::Unary(writer) => {
                let base = shared.duplex.uri();
                match connect::prepare_unary(writer, &shared.config, shared.use_get, &base, message)? {
                    UnaryRequest::Get(uri) => {
                        connect::strip_get_headers(&mut shared.duplex.request_headers());
                        shared.duplex.use_get(uri);
                        shared.duplex.send_full(TransportBody::empty()).await
                    }
                    UnaryRequest::Post(payload) => {
                        if let Some(name) = &payload.compression {
                            if let Ok(name) = HeaderValue::from_str(name) {
                                shared
                                    .duplex
                                    .request_headers()
                                    .insert(header::CONTENT_ENCODING, name);
                            }
                        }
                        shared.duplex.send_full(TransportBody::full(payload.data)).await
                    }
                }
            }
            Framing::Envelope(writer) => {
                let mut frames = Frames::default();
                writer.marshal(&mut frames, message).await?;
                for chunk in frames.0 {
                    if !shared.duplex.write(chunk).await? {
                        return Err(self.peer_closed().await);
                    }
                }
                Ok(())
            }
        }
    }

    /// The request body is gone; find out why.
    async fn peer_closed(&self) -> Error {
        let closed = || Error::unavailable("server closed the request stream");
        match self.shared.duplex.response_head().await {
            Err(err) => err,
            Ok(head) => match self.shared.wire {
                Wire::Grpc { .. } if grpc::is_trailers_only(&head.headers) => {
                    grpc::final_status(&head.headers, &HeaderMap::new()).unwrap_or_else(closed)
                }
                _ => closed(),
            },
        }
    }

    /// Half-close the request side.
    pub async fn close_request(&self) -> Result<(), Error> {
        self.shared.duplex.close_write().await
    }

    /// Receive the next message. `Ok(None)` is a clean end of the response;
    /// a failed call surfaces its status as the error.
    pub async fn receive<M: RpcMessage>(&self) -> Result<Option<M>, Error> {
        self.context().run(self.receive_message()).await
    }

    /// Receive exactly one message and check the response holds no more.
    pub async fn receive_unary<M: RpcMessage>(&self) -> Result<M, Error> {
        let Some(message) = self.receive::<M>().await? else {
            return Err(unary_cardinality_error("response", true));
        };
        match self.receive::<M>().await? {
            None => Ok(message),
            Some(_) => Err(unary_cardinality_error("response", false)),
        }
    }

    async fn receive_message<M: RpcMessage>(&self) -> Result<Option<M>, Error> {
        let shared = &*self.shared;
        if !self.spec().stream_type.is_client_stream() {
            shared.duplex.close_write().await?;
        }
        let mut receiver = shared.receiver.lock().await;
        self.ensure_open(&mut receiver).await;
        let step = match &mut *receiver {
            Receiver::Pending | Receiver::Done(None) => return Ok(None),
            Receiver::Done(Some(err)) => return Err(err.clone()),
            Receiver::Unary {
                stream,
                reader,
                done,
            } => {
                if *done {
                    Step::Finished(None)
                } else {
                    *done = true;
                    match reader.read::<M, _>(stream).await {
                        Ok(message) => return Ok(Some(message)),
                        Err(err) => Step::Finished(Some(err)),
                    }
                }
            }
            Receiver::Envelope { reader } => match reader.unmarshal::<M>().await {
                Ok(Next::Message(message)) => Step::Message(message),
                Ok(Next::Special(envelope)) => Step::Finished(self.finish_special(&envelope)),
                Ok(Next::End) => {
                    let trailers = reader.get_mut().take_trailers().unwrap_or_default();
                    Step::Finished(self.finish_end(trailers))
                }
                Err(err) => Step::Finished(Some(err)),
            },
        };
        match step {
            Step::Message(message) => Ok(Some(message)),
            Step::Finished(outcome) => {
                if let Some(err) = &outcome {
                    tracing::debug!(code = %err.code(), error = %err, "call failed");
                }
                *receiver = Receiver::Done(outcome.clone());
                outcome.map_or(Ok(None), Err)
            }
        }
    }

    fn finish_special(&self, envelope: &rpcwire_core::Envelope) -> Option<Error> {
        let shared = &*self.shared;
        match shared.wire {
            Wire::ConnectStream => match connect::end_stream(envelope) {
                Ok((trailers, err)) => {
                    *lock(&shared.response_trailers) = trailers;
                    err.map(|err| err.with_meta(self.metadata()))
                }
                Err(err) => Some(err),
            },
            Wire::Grpc { web: true } => match grpc::web_trailers(envelope) {
                Ok(trailers) => self.finish_end(trailers),
                Err(err) => Some(err),
            },
            _ => Some(Error::internal(format!(
                "protocol error: invalid envelope flags {}",
                envelope.flags
            ))),
        }
    }

    fn finish_end(&self, trailers: HeaderMap) -> Option<Error> {
        let shared = &*self.shared;
        match shared.wire {
            Wire::Grpc { .. } => {
                let headers = lock(&shared.response_headers).clone();
                let outcome = grpc::final_status(&headers, &trailers);
                *lock(&shared.response_trailers) = trailers;
                outcome
            }
            _ => Some(Error::internal(
                "protocol error: missing end-of-stream message",
            )),
        }
    }

    /// Response headers and trailers, merged.
    fn metadata(&self) -> HeaderMap {
        let mut meta = lock(&self.shared.response_headers).clone();
        merge_headers(&mut meta, &lock(&self.shared.response_trailers));
        meta
    }

    async fn ensure_open(&self, receiver: &mut Receiver) {
        if matches!(receiver, Receiver::Pending) {
            *receiver = self.open().await.unwrap_or_else(|err| {
                tracing::debug!(code = %err.code(), error = %err, "response rejected");
                Receiver::Done(Some(err))
            });
        }
    }

    async fn open(&self) -> Result<Receiver, Error> {
        let shared = &*self.shared;
        let head = shared.duplex.response_head().await?;
        tracing::trace!(status = %head.status, version = ?head.version, "response head");
        let body = shared
            .duplex
            .take_body()
            .ok_or_else(|| Error::internal("response body already taken"))?;
        let mut stream = BodyStream::with_classifier(body, classify_body);
        let content_type = header_str(&head.headers, header::CONTENT_TYPE)
            .unwrap_or_default()
            .to_string();
        let codec = shared.config.codec;
        let read_max = shared.config.read_max_bytes;

        match shared.wire {
            Wire::ConnectUnary => {
                let (headers, trailers) = connect::split_unary_trailers(&head.headers);
                *lock(&shared.response_headers) = headers;
                *lock(&shared.response_trailers) = trailers;
                wire::validate_unary_response_content_type(
                    codec.name(),
                    &shared.duplex.method(),
                    head.status,
                    &content_type,
                )
                .map_err(|e| with_protocol_hint(e, Protocol::Connect, &content_type))?;
                let compression =
                    self.response_compression(header_str(&head.headers, header::CONTENT_ENCODING))?;
                if head.status != StatusCode::OK {
                    let err =
                        connect::unary_error(head.status, &mut stream, compression.as_ref(), read_max)
                            .await;
                    return Err(err.with_meta(self.metadata()));
                }
                let reader = UnaryReader::new(codec, shared.buffers.clone())
                    .compression(compression)
                    .read_max_bytes(read_max);
                Ok(Receiver::Unary {
                    stream,
                    reader,
                    done: false,
                })
            }
            Wire::ConnectStream => {
                *lock(&shared.response_headers) = head.headers.clone();
                if head.status != StatusCode::OK {
                    return Err(http_status_error(head.status));
                }
                wire::validate_stream_response_content_type(codec.name(), &content_type)
                    .map_err(|e| with_protocol_hint(e, Protocol::Connect, &content_type))?;
                let compression = self.response_compression(header_str(
                    &head.headers,
                    wire::HEADER_STREAMING_CONTENT_ENCODING,
                ))?;
                Ok(Receiver::Envelope {
                    reader: self.envelope_reader(stream, compression),
                })
            }
            Wire::Grpc { web } => {
                *lock(&shared.response_headers) = head.headers.clone();
                if head.status != StatusCode::OK {
                    return Err(http_status_error(head.status));
                }
                if grpc::is_trailers_only(&head.headers) {
                    *lock(&shared.response_trailers) = head.headers.clone();
                    return Ok(Receiver::Done(grpc::final_status(
                        &head.headers,
                        &HeaderMap::new(),
                    )));
                }
                let protocol = if web { Protocol::GrpcWeb } else { Protocol::Grpc };
                grpc_wire::validate_response_content_type(web, codec.name(), &content_type)
                    .map_err(|e| with_protocol_hint(e, protocol, &content_type))?;
                let compression = self
                    .response_compression(header_str(&head.headers, grpc_wire::HEADER_COMPRESSION))?;
                Ok(Receiver::Envelope {
                    reader: self.envelope_reader(stream, compression),
                })
            }
        }
    }

    fn envelope_reader(
        &self,
        stream: ResponseStream,
        compression: Option<CompressionPool>,
    ) -> EnvelopeReader<ResponseStream> {
        EnvelopeReader::new(stream, self.shared.config.codec, self.shared.buffers.clone())
            .compression(compression)
            .read_max_bytes(self.shared.config.read_max_bytes)
    }

    fn response_compression(&self, name: Option<&str>) -> Result<Option<CompressionPool>, Error> {
        let pools = &self.shared.config.compression;
        match name {
            None | Some("") | Some(COMPRESSION_IDENTITY) => Ok(None),
            Some(name) => pools.get(name).cloned().map(Some).ok_or_else(|| {
                Error::internal(format!(
                    "unknown encoding {name:?}: accepted encodings are {}",
                    pools.comma_separated_names()
                ))
            }),
        }
    }

    /// Response headers, once the response arrived.
    pub async fn response_headers(&self) -> Result<HeaderMap, Error> {
        let shared = &*self.shared;
        self.context()
            .run(async {
                if !self.spec().stream_type.is_client_stream() {
                    shared.duplex.close_write().await?;
                }
                {
                    let mut receiver = shared.receiver.lock().await;
                    self.ensure_open(&mut receiver).await;
                }
                shared.duplex.response_head().await?;
                Ok(lock(&shared.response_headers).clone())
            })
            .await
    }

    /// Response trailers. Complete once the response was read to its end.
    pub fn response_trailers(&self) -> HeaderMap {
        lock(&self.shared.response_trailers).clone()
    }

    /// Stop reading the response. Later receives fail with `Canceled`.
    pub async fn close_response(&self) {
        let mut receiver = self.shared.receiver.lock().await;
        if !matches!(*receiver, Receiver::Done(_)) {
            *receiver = Receiver::Done(Some(Error::canceled("response closed")));
        }
    }
}

fn http_status_error(status: StatusCode) -> Error {
    Error::new(Code::from_http_status(status), format!("HTTP status {status}"))
}
