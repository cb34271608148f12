//! Wire protocol.
//!
//! A connection starts with a 5 byte [`Handshake`] written by the dialing
//! side. After that both directions carry the same frames: a [`Header`]
//! followed by at most one body, each prefixed with a big-endian `u32`
//! length and encoded with the negotiated [`CodecType`].
//!
//! ```text
//! | 4 bytes | 1 byte | 4 bytes    | N bytes | 4 bytes  | M bytes |
//! | magic   | codec  | header_len | header  | body_len | body    |
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, ErrorKind, Result};

mod framed;
pub use framed::{CodecReader, CodecWriter};

mod handshake;
pub use handshake::Handshake;

/// Identifies this protocol in the first four bytes of a connection.
pub const MAGIC_NUM: u32 = u32::from_be_bytes(*b"PLV!");
pub const MAX_MSG_SIZE: usize = 64 << 20;

/// Encoding used for headers and bodies on one connection.
#[derive(
    Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, Hash, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CodecType {
    #[default]
    #[value(name = "msgpack")]
    #[serde(rename = "msgpack")]
    MessagePack = 0,
    Json = 1,
}

impl CodecType {
    /// # Errors
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        let bytes = match self {
            CodecType::MessagePack => rmp_serde::to_vec_named(value)?,
            CodecType::Json => serde_json::to_vec(value)
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?,
        };
        Ok(bytes.into())
    }

    /// # Errors
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        if bytes.is_empty() {
            // a missing body reads as null, so `()` and `Option<T>` replies need no bytes.
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        match self {
            CodecType::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
            CodecType::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl TryFrom<u8> for CodecType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CodecType::MessagePack),
            1 => Ok(CodecType::Json),
            _ => Err(Error::new(
                ErrorKind::ProtocolError,
                format!("unsupported codec type: {value}"),
            )),
        }
    }
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecType::MessagePack => f.write_str("msgpack"),
            CodecType::Json => f.write_str("json"),
        }
    }
}

/// Frame header shared by requests and responses.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct Header {
    /// Target method in the form `"Service.Method"`.
    pub service_method: String,
    /// Correlation id chosen by the caller and echoed in the response.
    pub seq: u64,
    /// Non-empty only on failed responses, which then carry no body.
    pub error: String,
}

impl Header {
    #[must_use]
    pub fn request(service_method: &str, seq: u64) -> Self {
        Self {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}
