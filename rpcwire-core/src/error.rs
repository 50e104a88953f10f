//! The coded error shared by handlers and clients.
//!
//! - [`Error`]: code, message, details, metadata and a wire-origin flag
//! - [`ErrorDetail`]: a self-describing binary detail (`google.protobuf.Any`)

use std::error::Error as StdError;
use std::fmt;
use std::io;

use bytes::Bytes;
use http::HeaderMap;
use prost::Message;

use crate::code::Code;

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// A self-describing error detail.
///
/// Maps to `google.protobuf.Any` on the wire. `debug` caches a JSON rendering
/// for humans when the peer sent one.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorDetail {
    type_url: String,
    value: Bytes,
    debug: Option<serde_json::Value>,
}

impl ErrorDetail {
    /// Create a detail. A bare message name is expanded to a full type URL.
    pub fn new<S: Into<String>, B: Into<Bytes>>(type_url: S, value: B) -> Self {
        let mut type_url = type_url.into();
        if !type_url.contains('/') {
            type_url.insert_str(0, TYPE_URL_PREFIX);
        }
        Self {
            type_url,
            value: value.into(),
            debug: None,
        }
    }

    /// Pack a protobuf message as a detail.
    pub fn from_message<M: prost::Name>(message: &M) -> Self {
        Self::new(M::type_url(), message.encode_to_vec())
    }

    pub fn with_debug(mut self, debug: serde_json::Value) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Full type URL, e.g. `type.googleapis.com/google.rpc.RetryInfo`.
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Fully-qualified message name without the URL prefix.
    pub fn type_name(&self) -> &str {
        match self.type_url.rfind('/') {
            Some(idx) => &self.type_url[idx + 1..],
            None => &self.type_url,
        }
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn debug(&self) -> Option<&serde_json::Value> {
        self.debug.as_ref()
    }

    /// Decode the detail as a concrete message type.
    pub fn to_message<M: prost::Name + Default>(&self) -> Result<M, Error> {
        if self.type_name() != M::full_name() {
            return Err(Error::internal(format!(
                "error detail is {}, not {}",
                self.type_name(),
                M::full_name()
            )));
        }
        M::decode(self.value.clone())
            .map_err(|e| Error::internal(format!("decode error detail: {e}")))
    }
}

impl From<prost_types::Any> for ErrorDetail {
    fn from(any: prost_types::Any) -> Self {
        Self::new(any.type_url, any.value)
    }
}

impl From<&ErrorDetail> for prost_types::Any {
    fn from(detail: &ErrorDetail) -> Self {
        prost_types::Any {
            type_url: detail.type_url.clone(),
            value: detail.value.to_vec(),
        }
    }
}

/// A coded RPC error.
///
/// `wire` is set only for errors a peer explicitly sent. Handlers forward the
/// metadata of locally created errors to the client, but never the metadata
/// of an error received from another peer.
#[derive(Clone, Debug)]
pub struct Error {
    code: Code,
    message: String,
    details: Vec<ErrorDetail>,
    meta: HeaderMap,
    wire: bool,
}

macro_rules! code_constructors {
    ($($name:ident => $code:ident),* $(,)?) => {
        $(
            pub fn $name<S: Into<String>>(message: S) -> Self {
                Self::new(Code::$code, message)
            }
        )*
    };
}

impl Error {
    pub fn new<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
            meta: HeaderMap::new(),
            wire: false,
        }
    }

    /// An error received from a peer.
    pub fn from_wire<S: Into<String>>(code: Code, message: S) -> Self {
        Self {
            wire: true,
            ..Self::new(code, message)
        }
    }

    code_constructors! {
        canceled => Canceled,
        unknown => Unknown,
        invalid_argument => InvalidArgument,
        deadline_exceeded => DeadlineExceeded,
        not_found => NotFound,
        already_exists => AlreadyExists,
        permission_denied => PermissionDenied,
        resource_exhausted => ResourceExhausted,
        failed_precondition => FailedPrecondition,
        aborted => Aborted,
        out_of_range => OutOfRange,
        unimplemented => Unimplemented,
        internal => Internal,
        unavailable => Unavailable,
        data_loss => DataLoss,
        unauthenticated => Unauthenticated,
    }

    /// Classify an arbitrary error exactly once.
    ///
    /// An [`Error`] anywhere in the source chain is returned unchanged.
    /// Elapsed timers and timed-out I/O become `DeadlineExceeded`; anything
    /// else gets `fallback`.
    pub fn from_source(err: &(dyn StdError + 'static), fallback: Code) -> Self {
        let mut current: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(source) = current {
            if let Some(coded) = source.downcast_ref::<Error>() {
                return coded.clone();
            }
            if source.is::<tokio::time::error::Elapsed>() {
                return Self::deadline_exceeded(err.to_string());
            }
            if let Some(io_err) = source.downcast_ref::<io::Error>() {
                if io_err.kind() == io::ErrorKind::TimedOut {
                    return Self::deadline_exceeded(err.to_string());
                }
            }
            current = source.source();
        }
        Self::new(fallback, err.to_string())
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[ErrorDetail] {
        &self.details
    }

    pub fn add_detail(mut self, detail: ErrorDetail) -> Self {
        self.details.push(detail);
        self
    }

    pub fn set_details(&mut self, details: Vec<ErrorDetail>) {
        self.details = details;
    }

    /// Headers and trailers attached to the error.
    pub fn meta(&self) -> &HeaderMap {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut HeaderMap {
        &mut self.meta
    }

    pub fn with_meta(mut self, meta: HeaderMap) -> Self {
        self.meta = meta;
        self
    }

    /// Whether a peer explicitly sent this error.
    pub fn is_wire(&self) -> bool {
        self.wire
    }

    /// Prefix the message, keeping code and details.
    pub fn with_context<S: fmt::Display>(mut self, context: S) -> Self {
        self.message = if self.message.is_empty() {
            context.to_string()
        } else {
            format!("{context}: {}", self.message)
        };
        self
    }

    /// Encode as a `google.rpc.Status` protobuf.
    pub fn to_status_proto(&self) -> Vec<u8> {
        let status = crate::grpc::StatusProto {
            code: self.code.as_u32() as i32,
            message: self.message.clone(),
            details: self.details.iter().map(prost_types::Any::from).collect(),
        };
        status.encode_to_vec()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl StdError for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if let Some(coded) = err.get_ref().and_then(|inner| inner.downcast_ref::<Error>()) {
            return coded.clone();
        }
        Self::from_source(&err, Code::Unknown)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(err.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::other(err)
    }
}
