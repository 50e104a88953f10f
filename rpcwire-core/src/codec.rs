//! Message codecs.
//!
//! Messages are prost messages that also derive serde, so the same type can
//! travel as binary protobuf or as JSON.

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;

pub const CODEC_PROTO: &str = "proto";
pub const CODEC_JSON: &str = "json";
pub const CODEC_JSON_CHARSET_UTF8: &str = "json; charset=utf-8";

/// A message that can be carried by any [`Codec`].
pub trait RpcMessage: prost::Message + Serialize + DeserializeOwned + Default + 'static {}

impl<T> RpcMessage for T where T: prost::Message + Serialize + DeserializeOwned + Default + 'static {}

/// Serialization format of messages on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    Proto,
    Json,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Proto => CODEC_PROTO,
            Codec::Json => CODEC_JSON,
        }
    }

    /// Look up a codec by content-type suffix.
    pub fn from_name(name: &str) -> Option<Codec> {
        match name {
            CODEC_PROTO => Some(Codec::Proto),
            CODEC_JSON | CODEC_JSON_CHARSET_UTF8 => Some(Codec::Json),
            _ => None,
        }
    }

    /// Binary codecs need base64 in URLs.
    pub fn is_binary(&self) -> bool {
        matches!(self, Codec::Proto)
    }

    /// Whether `a` and `b` name the same codec, treating the JSON charset
    /// parameter as insignificant.
    pub fn same_name(a: &str, b: &str) -> bool {
        a == b
            || matches!(
                (a, b),
                (CODEC_JSON, CODEC_JSON_CHARSET_UTF8) | (CODEC_JSON_CHARSET_UTF8, CODEC_JSON)
            )
    }

    /// Append the encoded message to `buf`.
    pub fn marshal<M: RpcMessage>(&self, message: &M, buf: &mut BytesMut) -> Result<(), Error> {
        match self {
            Codec::Proto => {
                buf.reserve(message.encoded_len());
                message
                    .encode(buf)
                    .map_err(|e| Error::internal(format!("marshal message: {e}")))
            }
            Codec::Json => serde_json::to_writer((&mut *buf).writer(), message)
                .map_err(|e| Error::internal(format!("marshal message: {e}"))),
        }
    }

    /// Deterministic encoding, used where the bytes end up in a URL.
    pub fn marshal_stable<M: RpcMessage>(
        &self,
        message: &M,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        // prost writes fields in tag order and serde in declaration order.
        self.marshal(message, buf)
    }

    pub fn unmarshal<M: RpcMessage>(&self, data: &[u8]) -> Result<M, Error> {
        match self {
            Codec::Proto => M::decode(data)
                .map_err(|e| Error::invalid_argument(format!("unmarshal message: {e}"))),
            Codec::Json => serde_json::from_slice(data)
                .map_err(|e| Error::invalid_argument(format!("unmarshal message: {e}"))),
        }
    }
}
