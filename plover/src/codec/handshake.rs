use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CodecType, MAGIC_NUM};
use crate::error::{Error, ErrorKind, Result};

/// Connection preamble: magic number plus the codec selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub codec: CodecType,
}

impl Handshake {
    pub const LEN: usize = std::mem::size_of::<u32>() + 1;

    #[must_use]
    pub fn new(codec: CodecType) -> Self {
        Self { codec }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[..4].copy_from_slice(&MAGIC_NUM.to_be_bytes());
        bytes[4] = self.codec as u8;
        bytes
    }

    /// # Errors
    ///
    /// Returns a protocol error if the length, the magic number or the codec
    /// selector is wrong.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let Ok(bytes) = <[u8; Self::LEN]>::try_from(bytes) else {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("invalid handshake length: {}", bytes.len()),
            ));
        };
        let magic_num = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic_num != MAGIC_NUM {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("invalid magic num: {magic_num:08X}"),
            ));
        }
        Ok(Self {
            codec: CodecType::try_from(bytes[4])?,
        })
    }

    /// Reads exactly [`Handshake::LEN`] bytes and parses them.
    ///
    /// # Errors
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut bytes = [0u8; Self::LEN];
        reader
            .read_exact(&mut bytes)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpRecvMsgFailed, e.to_string()))?;
        Self::parse(&bytes)
    }

    /// # Errors
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_all(&self.to_bytes())
            .await
            .map_err(|e| Error::new(ErrorKind::ProtocolError, format!("write handshake: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::new(ErrorKind::ProtocolError, format!("write handshake: {e}")))
    }
}
