//! Per-call descriptors.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Shape of a call's message streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl StreamType {
    pub fn is_client_stream(&self) -> bool {
        matches!(self, StreamType::ClientStream | StreamType::BidiStream)
    }

    pub fn is_server_stream(&self) -> bool {
        matches!(self, StreamType::ServerStream | StreamType::BidiStream)
    }
}

/// Side-effect declaration of a procedure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IdempotencyLevel {
    #[default]
    Unknown,
    /// Safe to issue as an HTTP GET.
    NoSideEffects,
    Idempotent,
}

/// Immutable description of one call.
#[derive(Clone)]
pub struct Spec {
    pub stream_type: StreamType,
    /// Procedure path, e.g. `/acme.foo.v1.FooService/Bar`.
    pub procedure: String,
    /// Opaque schema handle, usually generated descriptor data.
    pub schema: Option<Arc<dyn Any + Send + Sync>>,
    pub is_client: bool,
    pub idempotency_level: IdempotencyLevel,
}

impl Spec {
    pub fn new<S: Into<String>>(procedure: S, stream_type: StreamType) -> Self {
        Self {
            stream_type,
            procedure: procedure.into(),
            schema: None,
            is_client: false,
            idempotency_level: IdempotencyLevel::Unknown,
        }
    }

    pub fn client(mut self) -> Self {
        self.is_client = true;
        self
    }

    pub fn with_idempotency(mut self, level: IdempotencyLevel) -> Self {
        self.idempotency_level = level;
        self
    }

    pub fn with_schema(mut self, schema: Arc<dyn Any + Send + Sync>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Unary procedures without side effects may be called with GET.
    pub fn allows_get(&self) -> bool {
        self.stream_type == StreamType::Unary
            && self.idempotency_level == IdempotencyLevel::NoSideEffects
    }
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spec")
            .field("stream_type", &self.stream_type)
            .field("procedure", &self.procedure)
            .field("schema", &self.schema.is_some())
            .field("is_client", &self.is_client)
            .field("idempotency_level", &self.idempotency_level)
            .finish()
    }
}
