//! Per-message compression.
//!
//! Compressors and decompressors are pooled per algorithm in a
//! [`CompressionPool`]; [`CompressionPools`] is the registry both sides
//! negotiate against. `gzip` is always available, `deflate`, `br` and `zstd`
//! are behind the `compression-*` features.

use std::fmt;
use std::io::{self, Read, Write};

use bytes::{BufMut, BytesMut};

use crate::error::Error;
use crate::pool::{Pool, Reset};

/// Name of the no-op algorithm. Never counts as a real algorithm.
pub const COMPRESSION_IDENTITY: &str = "identity";

pub const COMPRESSION_GZIP: &str = "gzip";

const POOL_CAPACITY: usize = 16;

/// Compresses whole messages.
pub trait Compressor: Send + 'static {
    fn compress(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()>;

    /// Drop any state tied to the last message.
    fn reset(&mut self) {}
}

/// Produces decompressing readers over a message.
pub trait Decompressor: Send + 'static {
    fn reader<'a>(&'a mut self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>>;

    fn reset(&mut self) {}
}

impl Reset for Box<dyn Compressor> {
    fn reset(&mut self) -> bool {
        Compressor::reset(self.as_mut());
        true
    }
}

impl Reset for Box<dyn Decompressor> {
    fn reset(&mut self) -> bool {
        Decompressor::reset(self.as_mut());
        true
    }
}

/// Pooled compressors and decompressors for one algorithm.
#[derive(Clone)]
pub struct CompressionPool {
    name: String,
    compressors: Pool<Box<dyn Compressor>>,
    decompressors: Pool<Box<dyn Decompressor>>,
}

impl CompressionPool {
    pub fn new<N, C, D>(name: N, compressor: C, decompressor: D) -> Self
    where
        N: Into<String>,
        C: Fn() -> Box<dyn Compressor> + Send + Sync + 'static,
        D: Fn() -> Box<dyn Decompressor> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            compressors: Pool::new(POOL_CAPACITY, compressor),
            decompressors: Pool::new(POOL_CAPACITY, decompressor),
        }
    }

    pub fn gzip() -> Self {
        Self::new(
            COMPRESSION_GZIP,
            || Box::new(GzipCompressor::default()),
            || Box::new(GzipDecompressor),
        )
    }

    #[cfg(feature = "compression-deflate")]
    pub fn deflate() -> Self {
        Self::new(
            "deflate",
            || Box::new(DeflateCompressor::default()),
            || Box::new(DeflateDecompressor),
        )
    }

    #[cfg(feature = "compression-br")]
    pub fn brotli() -> Self {
        Self::new(
            "br",
            || Box::new(BrotliCompressor::default()),
            || Box::new(BrotliDecompressor),
        )
    }

    #[cfg(feature = "compression-zstd")]
    pub fn zstd() -> Self {
        Self::new(
            "zstd",
            || Box::new(ZstdCompressor::default()),
            || Box::new(ZstdDecompressor),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compress `src`, appending to `dst`.
    pub fn compress(&self, src: &[u8], dst: &mut BytesMut) -> Result<(), Error> {
        let mut compressor = self.compressors.get();
        compressor
            .compress(src, dst)
            .map_err(|e| Error::internal(format!("compress: {e}")))
    }

    /// Decompress `src`, appending to `dst`.
    ///
    /// With a non-zero `read_max_bytes`, at most that many bytes are
    /// produced. A larger message is still fully drained so its true size
    /// can be reported.
    pub fn decompress(
        &self,
        src: &[u8],
        dst: &mut BytesMut,
        read_max_bytes: u64,
    ) -> Result<(), Error> {
        let mut decompressor = self.decompressors.get();
        let mut reader = decompressor
            .reader(src)
            .map_err(|e| Error::invalid_argument(format!("get decompressor: {e}")))?;
        let start = dst.len();
        let limit = if read_max_bytes > 0 {
            read_max_bytes.saturating_add(1)
        } else {
            u64::MAX
        };
        let mut writer = (&mut *dst).writer();
        let produced = io::copy(&mut (&mut reader).take(limit), &mut writer)
            .map_err(|e| Error::invalid_argument(format!("decompress: {e}")))?;
        if read_max_bytes > 0 && produced > read_max_bytes {
            let discarded = io::copy(&mut reader, &mut io::sink());
            dst.truncate(start);
            return Err(match discarded {
                Ok(discarded) => Error::resource_exhausted(format!(
                    "message size {} is larger than configured max {}",
                    produced + discarded,
                    read_max_bytes
                )),
                Err(e) => Error::resource_exhausted(format!(
                    "message is larger than configured max {read_max_bytes} - unable to determine message size: {e}"
                )),
            });
        }
        Ok(())
    }

    pub fn compressors(&self) -> &Pool<Box<dyn Compressor>> {
        &self.compressors
    }

    pub fn decompressors(&self) -> &Pool<Box<dyn Decompressor>> {
        &self.decompressors
    }
}

impl fmt::Debug for CompressionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompressionPool").field(&self.name).finish()
    }
}

/// Result of compression negotiation. `None` means identity.
#[derive(Clone, Debug, Default)]
pub struct Negotiated {
    pub request: Option<CompressionPool>,
    pub response: Option<CompressionPool>,
}

/// Registered algorithms, kept in registration order.
#[derive(Clone, Debug)]
pub struct CompressionPools {
    pools: Vec<CompressionPool>,
}

impl Default for CompressionPools {
    fn default() -> Self {
        Self {
            pools: vec![CompressionPool::gzip()],
        }
    }
}

impl CompressionPools {
    /// A registry with no algorithms besides identity.
    pub fn empty() -> Self {
        Self { pools: Vec::new() }
    }

    /// Every algorithm compiled into this build.
    pub fn all() -> Self {
        #[allow(unused_mut)]
        let mut pools = Self::default();
        #[cfg(feature = "compression-br")]
        pools.register(CompressionPool::brotli());
        #[cfg(feature = "compression-zstd")]
        pools.register(CompressionPool::zstd());
        #[cfg(feature = "compression-deflate")]
        pools.register(CompressionPool::deflate());
        pools
    }

    /// Add or replace an algorithm.
    pub fn register(&mut self, pool: CompressionPool) {
        match self.pools.iter_mut().find(|p| p.name == pool.name) {
            Some(existing) => *existing = pool,
            None => self.pools.push(pool),
        }
    }

    pub fn with(mut self, pool: CompressionPool) -> Self {
        self.register(pool);
        self
    }

    /// Look up an algorithm. Identity and the empty name have no pool.
    pub fn get(&self, name: &str) -> Option<&CompressionPool> {
        if name.is_empty() || name == COMPRESSION_IDENTITY {
            return None;
        }
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pools.iter().map(|p| p.name.as_str())
    }

    /// Names for accept-compression headers, e.g. `gzip,br`.
    pub fn comma_separated_names(&self) -> String {
        self.names().collect::<Vec<_>>().join(",")
    }

    /// Choose request and response compression.
    ///
    /// `sent` is the algorithm the peer used for its messages, `accept` the
    /// algorithms it can read. The response mirrors the request; otherwise
    /// the first accepted algorithm we support wins.
    pub fn negotiate(&self, sent: Option<&str>, accept: Option<&str>) -> Result<Negotiated, Error> {
        let mut negotiated = Negotiated::default();
        if let Some(sent) = sent.filter(|s| !s.is_empty() && *s != COMPRESSION_IDENTITY) {
            match self.get(sent) {
                Some(pool) => negotiated.request = Some(pool.clone()),
                None => {
                    return Err(Error::unimplemented(format!(
                        "unknown compression {sent:?}: supported encodings are {}",
                        self.comma_separated_names()
                    )));
                }
            }
        }
        negotiated.response = negotiated.request.clone();
        if negotiated.response.is_none() {
            if let Some(accept) = accept {
                negotiated.response = accept
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|name| !name.is_empty())
                    .find_map(|name| self.get(name))
                    .cloned();
            }
        }
        Ok(negotiated)
    }
}

/// Gzip via flate2.
#[derive(Debug)]
pub struct GzipCompressor {
    level: flate2::Compression,
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: flate2::Compression::default(),
        }
    }
}

impl GzipCompressor {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level.min(9)),
        }
    }
}

impl Compressor for GzipCompressor {
    fn compress(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let mut encoder = flate2::write::GzEncoder::new((&mut *dst).writer(), self.level);
        encoder.write_all(src)?;
        encoder.finish()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct GzipDecompressor;

impl Decompressor for GzipDecompressor {
    fn reader<'a>(&'a mut self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(flate2::read::GzDecoder::new(src)))
    }
}

/// Deflate (zlib framing, RFC 1950) via flate2.
#[cfg(feature = "compression-deflate")]
#[derive(Debug, Default)]
pub struct DeflateCompressor {
    level: flate2::Compression,
}

#[cfg(feature = "compression-deflate")]
impl Compressor for DeflateCompressor {
    fn compress(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let mut encoder = flate2::write::ZlibEncoder::new((&mut *dst).writer(), self.level);
        encoder.write_all(src)?;
        encoder.finish()?;
        Ok(())
    }
}

#[cfg(feature = "compression-deflate")]
#[derive(Debug, Default)]
pub struct DeflateDecompressor;

#[cfg(feature = "compression-deflate")]
impl Decompressor for DeflateDecompressor {
    fn reader<'a>(&'a mut self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(flate2::read::ZlibDecoder::new(src)))
    }
}

/// Brotli, quality 0-11 (default 4).
#[cfg(feature = "compression-br")]
#[derive(Debug)]
pub struct BrotliCompressor {
    quality: u32,
}

#[cfg(feature = "compression-br")]
impl Default for BrotliCompressor {
    fn default() -> Self {
        Self { quality: 4 }
    }
}

#[cfg(feature = "compression-br")]
impl Compressor for BrotliCompressor {
    fn compress(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let params = brotli::enc::BrotliEncoderParams {
            quality: self.quality as i32,
            ..Default::default()
        };
        let mut writer = (&mut *dst).writer();
        brotli::enc::BrotliCompress(&mut io::Cursor::new(src), &mut writer, &params)?;
        Ok(())
    }
}

#[cfg(feature = "compression-br")]
#[derive(Debug, Default)]
pub struct BrotliDecompressor;

#[cfg(feature = "compression-br")]
impl Decompressor for BrotliDecompressor {
    fn reader<'a>(&'a mut self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(brotli::Decompressor::new(src, 4096)))
    }
}

/// Zstd, level 1-22 (default 3).
#[cfg(feature = "compression-zstd")]
#[derive(Debug)]
pub struct ZstdCompressor {
    level: i32,
}

#[cfg(feature = "compression-zstd")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self { level: 3 }
    }
}

#[cfg(feature = "compression-zstd")]
impl Compressor for ZstdCompressor {
    fn compress(&mut self, src: &[u8], dst: &mut BytesMut) -> io::Result<()> {
        let compressed = zstd::bulk::compress(src, self.level)?;
        dst.extend_from_slice(&compressed);
        Ok(())
    }
}

#[cfg(feature = "compression-zstd")]
#[derive(Debug, Default)]
pub struct ZstdDecompressor;

#[cfg(feature = "compression-zstd")]
impl Decompressor for ZstdDecompressor {
    fn reader<'a>(&'a mut self, src: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(zstd::stream::read::Decoder::with_buffer(src)?))
    }
}
