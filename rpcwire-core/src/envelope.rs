//! Length-prefixed envelope framing.
//!
//! ```text
//! [flags:1][length:4 big-endian][payload:length]
//! ```
//!
//! Used by Connect streaming, gRPC and gRPC-Web. [`EnvelopeWriter`] marshals
//! and compresses messages into a sink of byte chunks, [`EnvelopeReader`]
//! parses them back out of a stream of chunks.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};

use crate::codec::{Codec, RpcMessage};
use crate::compression::CompressionPool;
use crate::error::Error;
use crate::pool::BufferPool;

/// Envelope flag bits.
pub mod envelope_flags {
    /// The payload is compressed with the negotiated algorithm.
    pub const COMPRESSED: u8 = 0b0000_0001;
    /// Connect end-of-stream frame carrying a JSON end-stream message.
    pub const END_STREAM: u8 = 0b0000_0010;
    /// gRPC-Web frame carrying trailers.
    pub const TRAILER: u8 = 0b1000_0000;
}

pub const ENVELOPE_PREFIX_LEN: usize = 5;

/// Envelopes at most this large are copied into one pooled chunk; larger
/// payloads are written through as a separate prefix and payload.
const WRITE_THROUGH_THRESHOLD: usize = 16 * 1024;

/// One frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub data: Bytes,
}

impl Envelope {
    pub fn new(flags: u8, data: Bytes) -> Self {
        Self { flags, data }
    }

    pub fn is_set(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    /// End-stream or trailer frames, as opposed to data frames.
    pub fn is_special(&self) -> bool {
        self.flags & !envelope_flags::COMPRESSED != 0
    }

    /// Encode prefix and payload into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.reserve(ENVELOPE_PREFIX_LEN + self.data.len());
        buf.put_slice(&envelope_prefix(self.flags, self.data.len())?);
        buf.put_slice(&self.data);
        Ok(())
    }
}

/// The 5-byte prefix for a payload of `len` bytes.
pub fn envelope_prefix(flags: u8, len: usize) -> Result<[u8; ENVELOPE_PREFIX_LEN], Error> {
    let len = u32::try_from(len).map_err(|_| {
        Error::resource_exhausted(format!(
            "message size {len} exceeds maximum envelope size {}",
            u32::MAX
        ))
    })?;
    let mut prefix = [0u8; ENVELOPE_PREFIX_LEN];
    prefix[0] = flags;
    prefix[1..].copy_from_slice(&len.to_be_bytes());
    Ok(prefix)
}

/// Result of reading one message.
#[derive(Debug)]
pub enum Next<M> {
    Message(M),
    /// An end-stream or trailer frame, already decompressed.
    Special(Envelope),
    /// The stream ended cleanly on a frame boundary.
    End,
}

/// Marshals messages into envelopes.
#[derive(Clone, Debug)]
pub struct EnvelopeWriter {
    codec: Codec,
    compression: Option<CompressionPool>,
    compress_min_bytes: usize,
    send_max_bytes: usize,
    buffers: BufferPool,
}

impl EnvelopeWriter {
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

    /// Zero means unlimited.
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

    /// Marshal a message and write it as a data frame.
    pub async fn marshal<M, S>(&self, sink: &mut S, message: &M) -> Result<(), Error>
    where
        M: RpcMessage,
        S: Sink<Bytes, Error = Error> + Unpin,
    {
        let mut buf = self.buffers.get();
        self.codec.marshal(message, &mut buf)?;
        let data = buf.split().freeze();
        self.write(sink, Envelope::new(0, data)).await
    }

    /// Write a frame, compressing it when worthwhile.
    pub async fn write<S>(&self, sink: &mut S, envelope: Envelope) -> Result<(), Error>
    where
        S: Sink<Bytes, Error = Error> + Unpin,
    {
        let envelope = self.prepare(envelope)?;
        self.write_raw(sink, envelope).await
    }

    fn prepare(&self, envelope: Envelope) -> Result<Envelope, Error> {
        let pool = match &self.compression {
            Some(pool)
                if !envelope.is_set(envelope_flags::COMPRESSED)
                    && envelope.data.len() >= self.compress_min_bytes =>
            {
                pool
            }
            _ => {
                if self.send_max_bytes > 0 && envelope.data.len() > self.send_max_bytes {
                    return Err(Error::resource_exhausted(format!(
                        "message size {} exceeds sendMaxBytes {}",
                        envelope.data.len(),
                        self.send_max_bytes
                    )));
                }
                return Ok(envelope);
            }
        };
        let mut compressed = self.buffers.get();
        pool.compress(&envelope.data, &mut compressed)?;
        if self.send_max_bytes > 0 && compressed.len() > self.send_max_bytes {
            return Err(Error::resource_exhausted(format!(
                "compressed message size {} exceeds sendMaxBytes {}",
                compressed.len(),
                self.send_max_bytes
            )));
        }
        Ok(Envelope::new(
            envelope.flags | envelope_flags::COMPRESSED,
            compressed.split().freeze(),
        ))
    }

    async fn write_raw<S>(&self, sink: &mut S, envelope: Envelope) -> Result<(), Error>
    where
        S: Sink<Bytes, Error = Error> + Unpin,
    {
        tracing::trace!(flags = envelope.flags, len = envelope.data.len(), "write envelope");
        if envelope.data.len() <= WRITE_THROUGH_THRESHOLD {
            let mut frame = self.buffers.get();
            envelope.encode(&mut frame)?;
            return sink.send(frame.split().freeze()).await;
        }
        let prefix = envelope_prefix(envelope.flags, envelope.data.len())?;
        sink.feed(Bytes::copy_from_slice(&prefix)).await?;
        sink.send(envelope.data).await
    }
}

/// Reads envelopes from a stream of byte chunks.
pub struct EnvelopeReader<S> {
    stream: S,
    buffer: BytesMut,
    codec: Codec,
    compression: Option<CompressionPool>,
    read_max_bytes: usize,
    bytes_read: u64,
    buffers: BufferPool,
}

impl<S> EnvelopeReader<S>
where
    S: Stream<Item = Result<Bytes, Error>> + Unpin,
{
    pub fn new(stream: S, codec: Codec, buffers: BufferPool) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            codec,
            compression: None,
            read_max_bytes: 0,
            bytes_read: 0,
            buffers,
        }
    }

    pub fn compression(mut self, compression: Option<CompressionPool>) -> Self {
        self.compression = compression;
        self
    }

    /// Zero means unlimited.
    pub fn read_max_bytes(mut self, max: usize) -> Self {
        self.read_max_bytes = max;
        self
    }

    /// Bytes consumed from the underlying stream so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Pull chunks until at least `n` bytes are buffered.
    /// Returns `false` if the stream ended first.
    async fn fill(&mut self, n: usize) -> Result<bool, Error> {
        while self.buffer.len() < n {
            match self.stream.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    self.bytes_read += chunk.len() as u64;
                    self.buffer.extend_from_slice(&chunk);
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Skip `n` bytes without buffering them. Returns the number skipped.
    async fn discard(&mut self, mut n: usize) -> Result<usize, Error> {
        let mut skipped = n.min(self.buffer.len());
        self.buffer.advance(skipped);
        n -= skipped;
        while n > 0 {
            match self.stream.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    self.bytes_read += chunk.len() as u64;
                    if chunk.len() > n {
                        self.buffer.extend_from_slice(&chunk[n..]);
                        skipped += n;
                        n = 0;
                    } else {
                        skipped += chunk.len();
                        n -= chunk.len();
                    }
                }
                None => break,
            }
        }
        Ok(skipped)
    }

    /// Read one raw frame. `None` on a clean end of stream.
    pub async fn read(&mut self) -> Result<Option<Envelope>, Error> {
        if !self.fill(ENVELOPE_PREFIX_LEN).await? {
            if self.buffer.is_empty() {
                return Ok(None);
            }
            return Err(Error::invalid_argument(
                "protocol error: incomplete envelope",
            ));
        }
        let flags = self.buffer[0];
        let size = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        self.buffer.advance(ENVELOPE_PREFIX_LEN);

        if self.read_max_bytes > 0 && size > self.read_max_bytes {
            self.discard(size).await.map_err(|e| {
                Error::resource_exhausted(format!(
                    "message is larger than configured max {} - unable to determine message size: {e}",
                    self.read_max_bytes
                ))
            })?;
            return Err(Error::resource_exhausted(format!(
                "message size {size} is larger than configured max {}",
                self.read_max_bytes
            )));
        }

        if !self.fill(size).await? {
            return Err(Error::invalid_argument(format!(
                "protocol error: promised {size} bytes in enveloped message, got {} bytes",
                self.buffer.len()
            )));
        }
        let data = self.buffer.split_to(size).freeze();
        tracing::trace!(flags, len = size, "read envelope");
        Ok(Some(Envelope::new(flags, data)))
    }

    /// Read and decode the next message.
    pub async fn unmarshal<M: RpcMessage>(&mut self) -> Result<Next<M>, Error> {
        let Some(envelope) = self.read().await? else {
            return Ok(Next::End);
        };
        let compressed = envelope.is_set(envelope_flags::COMPRESSED);
        let pool = match (&self.compression, compressed) {
            (None, true) => {
                return Err(Error::internal(
                    "protocol error: received compressed message without compression support",
                ));
            }
            (Some(pool), true) if !envelope.data.is_empty() => Some(pool.clone()),
            _ => None,
        };
        let data = match pool {
            Some(pool) => {
                let mut decompressed = self.buffers.get();
                pool.decompress(&envelope.data, &mut decompressed, self.read_max_bytes as u64)?;
                decompressed.split().freeze()
            }
            None => envelope.data,
        };

        if envelope.flags & !envelope_flags::COMPRESSED != 0 {
            let extra = self.discard(usize::MAX).await?;
            if extra > 0 {
                return Err(Error::internal(format!(
                    "corrupt response: {extra} extra bytes after end of stream"
                )));
            }
            return Ok(Next::Special(Envelope::new(envelope.flags, data)));
        }
        Ok(Next::Message(self.codec.unmarshal(&data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Code;
    use crate::codec::tests::Greeting;
    use crate::compression::CompressionPool;
    use futures::channel::mpsc;
    use futures::stream;

    fn chunks(data: Vec<Bytes>) -> impl Stream<Item = Result<Bytes, Error>> + Unpin {
        stream::iter(data.into_iter().map(Ok))
    }

    fn reader(data: Vec<Bytes>) -> EnvelopeReader<impl Stream<Item = Result<Bytes, Error>> + Unpin> {
        EnvelopeReader::new(chunks(data), Codec::Proto, BufferPool::default())
    }

    fn sink() -> (
        impl Sink<Bytes, Error = Error> + Unpin,
        mpsc::UnboundedReceiver<Bytes>,
    ) {
        let (tx, rx) = mpsc::unbounded();
        (tx.sink_map_err(|e| Error::internal(e.to_string())), rx)
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<Bytes>) -> Vec<Bytes> {
        rx.close();
        rx.collect().await
    }

    #[test]
    fn test_envelope_prefix() {
        assert_eq!(envelope_prefix(0x02, 258).unwrap(), [0x02, 0, 0, 1, 2]);
        let env = Envelope::new(envelope_flags::COMPRESSED, Bytes::new());
        assert!(env.is_set(envelope_flags::COMPRESSED));
        assert!(!env.is_special());
        assert!(Envelope::new(0x80, Bytes::new()).is_special());
    }

    #[tokio::test]
    async fn test_envelope_round_trip() {
        let payloads = [
            Bytes::new(),
            Bytes::from_static(b"hello"),
            Bytes::from(vec![9u8; WRITE_THROUGH_THRESHOLD + 1]),
        ];
        for flags in [0u8, 0x02, 0x80] {
            for payload in &payloads {
                let mut buf = BytesMut::new();
                Envelope::new(flags, payload.clone()).encode(&mut buf).unwrap();
                // split the frame at every awkward boundary
                let frozen = buf.freeze();
                let parts = vec![frozen.slice(..3), frozen.slice(3..)];
                let mut r = reader(parts);
                let env = r.read().await.unwrap().unwrap();
                assert_eq!(env.flags, flags);
                assert_eq!(&env.data, payload);
                assert!(r.read().await.unwrap().is_none());
                assert_eq!(r.bytes_read(), (payload.len() + 5) as u64);
            }
        }
    }

    #[tokio::test]
    async fn test_envelope_read_at_max_boundary() {
        let mut buf = BytesMut::new();
        Envelope::new(0, Bytes::from(vec![1u8; 10])).encode(&mut buf).unwrap();
        let mut r = EnvelopeReader::new(chunks(vec![buf.freeze()]), Codec::Proto, BufferPool::default())
            .read_max_bytes(10);
        assert_eq!(r.read().await.unwrap().unwrap().data.len(), 10);
    }

    #[tokio::test]
    async fn test_envelope_incomplete_prefix() {
        let mut r = reader(vec![Bytes::from_static(&[0, 0, 0])]);
        let err = r.read().await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "protocol error: incomplete envelope");
    }

    #[tokio::test]
    async fn test_envelope_short_payload() {
        let mut r = reader(vec![Bytes::from_static(&[0, 0, 0, 0, 10, 1, 2, 3])]);
        let err = r.read().await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(
            err.message(),
            "protocol error: promised 10 bytes in enveloped message, got 3 bytes"
        );
    }

    #[tokio::test]
    async fn test_envelope_oversized_frame_is_discarded() {
        let mut buf = BytesMut::new();
        Envelope::new(0, Bytes::from(vec![1u8; 100])).encode(&mut buf).unwrap();
        Envelope::new(0, Bytes::from_static(b"ok")).encode(&mut buf).unwrap();
        let frozen = buf.freeze();
        let parts = vec![frozen.slice(..50), frozen.slice(50..)];
        let mut r = EnvelopeReader::new(chunks(parts), Codec::Proto, BufferPool::default())
            .read_max_bytes(50);
        let err = r.read().await.unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(err.message(), "message size 100 is larger than configured max 50");
        // the next frame is still readable
        assert_eq!(r.read().await.unwrap().unwrap().data, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn test_writer_small_payload_is_single_chunk() {
        let writer = EnvelopeWriter::new(Codec::Proto, BufferPool::default());
        let (mut tx, rx) = sink();
        let message = Greeting {
            text: "hi".into(),
            count: 1,
        };
        writer.marshal(&mut tx, &message).await.unwrap();
        let written = collect(rx).await;
        assert_eq!(written.len(), 1);
        assert_eq!(written[0][0], 0);

        let mut r = reader(written);
        match r.unmarshal::<Greeting>().await.unwrap() {
            Next::Message(m) => assert_eq!(m, message),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(r.unmarshal::<Greeting>().await.unwrap(), Next::End));
    }

    #[tokio::test]
    async fn test_writer_large_payload_is_written_through() {
        let writer = EnvelopeWriter::new(Codec::Proto, BufferPool::default());
        let (mut tx, rx) = sink();
        let payload = Bytes::from(vec![3u8; WRITE_THROUGH_THRESHOLD * 2]);
        writer.write(&mut tx, Envelope::new(0, payload.clone())).await.unwrap();
        let written = collect(rx).await;
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].len(), ENVELOPE_PREFIX_LEN);
        assert_eq!(written[1], payload);
    }

    #[tokio::test]
    async fn test_writer_compresses_above_min_bytes() {
        let writer = EnvelopeWriter::new(Codec::Proto, BufferPool::default())
            .compression(Some(CompressionPool::gzip()))
            .compress_min_bytes(10);
        let (mut tx, rx) = sink();
        writer.write(&mut tx, Envelope::new(0, Bytes::from_static(b"tiny"))).await.unwrap();
        writer
            .write(&mut tx, Envelope::new(0, Bytes::from(vec![b'x'; 1000])))
            .await
            .unwrap();
        let written = collect(rx).await;
        assert_eq!(written[0][0], 0);
        assert_eq!(written[1][0], envelope_flags::COMPRESSED);
        assert!(written[1].len() < 1000);

        let mut r = reader(written).compression(Some(CompressionPool::gzip()));
        assert_eq!(r.read().await.unwrap().unwrap().data, Bytes::from_static(b"tiny"));
    }

    #[tokio::test]
    async fn test_writer_send_max_bytes() {
        let writer = EnvelopeWriter::new(Codec::Proto, BufferPool::default()).send_max_bytes(4);
        let (mut tx, _rx) = sink();
        let err = writer
            .write(&mut tx, Envelope::new(0, Bytes::from_static(b"too long")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(err.message(), "message size 8 exceeds sendMaxBytes 4");

        let writer = EnvelopeWriter::new(Codec::Proto, BufferPool::default())
            .compression(Some(CompressionPool::gzip()))
            .send_max_bytes(8);
        let err = writer
            .write(&mut tx, Envelope::new(0, Bytes::from_static(b"12345678")))
            .await
            .unwrap_err();
        assert!(err.message().starts_with("compressed message size "));
    }

    #[tokio::test]
    async fn test_reader_rejects_unexpected_compression() {
        let mut buf = BytesMut::new();
        Envelope::new(envelope_flags::COMPRESSED, Bytes::from_static(b"zz"))
            .encode(&mut buf)
            .unwrap();
        let mut r = reader(vec![buf.freeze()]);
        let err = r.unmarshal::<Greeting>().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_reader_special_frame_with_trailing_bytes() {
        let mut buf = BytesMut::new();
        Envelope::new(envelope_flags::END_STREAM, Bytes::from_static(b"{}"))
            .encode(&mut buf)
            .unwrap();
        let end = buf.split().freeze();
        let mut r = reader(vec![end.clone()]);
        match r.unmarshal::<Greeting>().await.unwrap() {
            Next::Special(env) => assert_eq!(env.data, Bytes::from_static(b"{}")),
            other => panic!("unexpected {other:?}"),
        }

        let mut r = reader(vec![end, Bytes::from_static(b"junk")]);
        let err = r.unmarshal::<Greeting>().await.unwrap_err();
        assert_eq!(err.message(), "corrupt response: 4 extra bytes after end of stream");
    }
}
