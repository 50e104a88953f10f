//! Handler configuration.
//!
//! One [`HandlerConfig`] is shared by every call a [`Handler`](crate::Handler)
//! serves. Limits use `0` for "unlimited".
//!
//! ```rust,ignore
//! let config = HandlerConfig::new()
//!     .read_max_bytes(4 * 1024 * 1024)
//!     .compress_min_bytes(1024)
//!     .require_connect_protocol_header(true);
//! ```

use rpcwire_core::{BufferPool, Codec, CompressionPools};

#[derive(Clone, Debug)]
pub struct HandlerConfig {
    pub(crate) codecs: Vec<Codec>,
    pub(crate) compression: CompressionPools,
    pub(crate) read_max_bytes: usize,
    pub(crate) send_max_bytes: usize,
    pub(crate) compress_min_bytes: usize,
    pub(crate) require_connect_protocol_header: bool,
    pub(crate) buffers: BufferPool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            codecs: vec![Codec::Proto, Codec::Json],
            compression: CompressionPools::default(),
            read_max_bytes: 0,
            send_max_bytes: 0,
            compress_min_bytes: 0,
            require_connect_protocol_header: false,
            buffers: BufferPool::default(),
        }
    }
}

impl HandlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the accepted codecs. The first one is used for error bodies
    /// when the request named no usable codec.
    pub fn codecs(mut self, codecs: Vec<Codec>) -> Self {
        self.codecs = codecs;
        self
    }

    /// Replace the registered compression algorithms.
    pub fn compression(mut self, pools: CompressionPools) -> Self {
        self.compression = pools;
        self
    }

    /// Maximum size of a request message, after decompression.
    pub fn read_max_bytes(mut self, max: usize) -> Self {
        self.read_max_bytes = max;
        self
    }

    /// Maximum size of a response message, after compression.
    pub fn send_max_bytes(mut self, max: usize) -> Self {
        self.send_max_bytes = max;
        self
    }

    /// Responses smaller than this are never compressed.
    pub fn compress_min_bytes(mut self, min: usize) -> Self {
        self.compress_min_bytes = min;
        self
    }

    /// Reject Connect requests that do not carry the protocol version.
    pub fn require_connect_protocol_header(mut self, require: bool) -> Self {
        self.require_connect_protocol_header = require;
        self
    }

    /// Share a buffer pool with other handlers.
    pub fn buffers(mut self, buffers: BufferPool) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn get_codecs(&self) -> &[Codec] {
        &self.codecs
    }

    pub fn get_compression(&self) -> &CompressionPools {
        &self.compression
    }

    pub(crate) fn codec(&self, name: &str) -> Option<Codec> {
        Codec::from_name(name).filter(|codec| self.codecs.contains(codec))
    }

    pub(crate) fn default_codec(&self) -> Codec {
        self.codecs.first().copied().unwrap_or(Codec::Proto)
    }
}
