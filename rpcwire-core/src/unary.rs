//! Whole-body messages used by Connect unary calls.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::codec::{Codec, RpcMessage};
use crate::compression::CompressionPool;
use crate::error::Error;
use crate::pool::BufferPool;

/// A marshaled unary payload.
#[derive(Clone, Debug)]
pub struct UnaryPayload {
    pub data: Bytes,
    /// Name of the algorithm the payload was compressed with.
    pub compression: Option<String>,
}

/// Marshals a single message as a whole body.
#[derive(Clone, Debug)]
pub struct UnaryWriter {
    codec: Codec,
    compression: Option<CompressionPool>,
    compress_min_bytes: usize,
    send_max_bytes: usize,
    buffers: BufferPool,
}

impl UnaryWriter {
    pub fn new(codec: Codec, buffers: BufferPool) -> Self {
        Self {
            codec,
            compression: None,
            compress_min_bytes: 0,
            send_max_bytes: 0,
            buffers,
        }
    }

    pub fn compression(mut self, compression: Option<CompressionPool>) -> Self {
        self.compression = compression;
        self
    }

    pub fn compress_min_bytes(mut self, min: usize) -> Self {
        self.compress_min_bytes = min;
        self
    }

    pub fn send_max_bytes(mut self, max: usize) -> Self {
        self.send_max_bytes = max;
        self
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn compression_pool(&self) -> Option<&CompressionPool> {
        self.compression.as_ref()
    }

    pub fn send_max(&self) -> usize {
        self.send_max_bytes
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn marshal<M: RpcMessage>(&self, message: &M) -> Result<UnaryPayload, Error> {
        let mut buf = self.buffers.get();
        self.codec.marshal(message, &mut buf)?;
        self.finish(buf.split().freeze())
    }

    /// Compress an encoded message when worthwhile and enforce the send limit.
    pub fn finish(&self, data: Bytes) -> Result<UnaryPayload, Error> {
        let pool = match &self.compression {
            Some(pool) if data.len() >= self.compress_min_bytes => pool,
            _ => {
                if self.send_max_bytes > 0 && data.len() > self.send_max_bytes {
                    return Err(Error::resource_exhausted(format!(
                        "message size {} exceeds sendMaxBytes {}",
                        data.len(),
                        self.send_max_bytes
                    )));
                }
                return Ok(UnaryPayload {
                    data,
                    compression: None,
                });
            }
        };
        let mut compressed = self.buffers.get();
        pool.compress(&data, &mut compressed)?;
        if self.send_max_bytes > 0 && compressed.len() > self.send_max_bytes {
            return Err(Error::resource_exhausted(format!(
                "compressed message size {} exceeds sendMaxBytes {}",
                compressed.len(),
                self.send_max_bytes
            )));
        }
        Ok(UnaryPayload {
            data: compressed.split().freeze(),
            compression: Some(pool.name().to_string()),
        })
    }
}

/// Reads a single message from a whole body.
#[derive(Clone, Debug)]
pub struct UnaryReader {
    codec: Codec,
    compression: Option<CompressionPool>,
    read_max_bytes: usize,
    buffers: BufferPool,
}

impl UnaryReader {
    pub fn new(codec: Codec, buffers: BufferPool) -> Self {
        Self {
            codec,
            compression: None,
            read_max_bytes: 0,
            buffers,
        }
    }

    pub fn compression(mut self, compression: Option<CompressionPool>) -> Self {
        self.compression = compression;
        self
    }

    pub fn read_max_bytes(mut self, max: usize) -> Self {
        self.read_max_bytes = max;
        self
    }

    /// Read the rest of `stream` and decode it.
    ///
    /// Reading stops at `read_max_bytes + 1`; an oversized body is drained so
    /// the connection can be reused and reported with its full size.
    pub async fn read<M, S>(&self, stream: &mut S) -> Result<M, Error>
    where
        M: RpcMessage,
        S: Stream<Item = Result<Bytes, Error>> + Unpin,
    {
        let mut buf = self.buffers.get();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.with_context("read message"))?;
            buf.extend_from_slice(&chunk);
            if self.read_max_bytes > 0 && buf.len() > self.read_max_bytes {
                let mut total = buf.len();
                while let Some(rest) = stream.next().await {
                    match rest {
                        Ok(rest) => total += rest.len(),
                        Err(e) => {
                            return Err(Error::resource_exhausted(format!(
                                "message is larger than configured max {} - unable to determine message size: {e}",
                                self.read_max_bytes
                            )));
                        }
                    }
                }
                return Err(Error::resource_exhausted(format!(
                    "message size {total} is larger than configured max {}",
                    self.read_max_bytes
                )));
            }
        }
        self.decode(&buf)
    }

    /// Decompress if needed and decode.
    pub fn decode<M: RpcMessage>(&self, data: &[u8]) -> Result<M, Error> {
        match &self.compression {
            Some(pool) if !data.is_empty() => {
                let mut decompressed = self.buffers.get();
                pool.decompress(data, &mut decompressed, self.read_max_bytes as u64)?;
                self.codec.unmarshal(&decompressed)
            }
            _ => self.codec.unmarshal(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Code;
    use crate::codec::tests::Greeting;
    use futures::stream;

    fn body(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes, Error>> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p))))
    }

    #[tokio::test]
    async fn test_unary_round_trip_with_compression() {
        let message = Greeting {
            text: "x".repeat(200),
            count: 9,
        };
        let writer = UnaryWriter::new(Codec::Json, BufferPool::default())
            .compression(Some(CompressionPool::gzip()))
            .compress_min_bytes(64);
        let payload = writer.marshal(&message).unwrap();
        assert_eq!(payload.compression.as_deref(), Some("gzip"));

        let reader = UnaryReader::new(Codec::Json, BufferPool::default())
            .compression(Some(CompressionPool::gzip()));
        let mut stream = stream::iter(vec![Ok(payload.data)]);
        let back: Greeting = reader.read(&mut stream).await.unwrap();
        assert_eq!(back, message);
    }

    #[tokio::test]
    async fn test_unary_small_message_is_not_compressed() {
        let writer = UnaryWriter::new(Codec::Proto, BufferPool::default())
            .compression(Some(CompressionPool::gzip()))
            .compress_min_bytes(1024);
        let payload = writer.marshal(&Greeting::default()).unwrap();
        assert!(payload.compression.is_none());
    }

    #[tokio::test]
    async fn test_unary_read_max_bytes_drains_body() {
        let reader = UnaryReader::new(Codec::Json, BufferPool::default()).read_max_bytes(4);
        let mut stream = body(vec![b"{\"te", b"xt\":", b"\"abc\"}"]);
        let err = reader.read::<Greeting, _>(&mut stream).await.unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(err.message(), "message size 14 is larger than configured max 4");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unary_empty_body_is_default_message() {
        let reader = UnaryReader::new(Codec::Proto, BufferPool::default());
        let mut stream = body(vec![]);
        let message: Greeting = reader.read(&mut stream).await.unwrap();
        assert_eq!(message, Greeting::default());
    }

    #[test]
    fn test_unary_send_max_bytes() {
        let writer = UnaryWriter::new(Codec::Json, BufferPool::default()).send_max_bytes(5);
        let err = writer.marshal(&Greeting::default()).unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
    }
}
