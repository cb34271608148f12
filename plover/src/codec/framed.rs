use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{CodecType, Header, MAX_MSG_SIZE};
use crate::{
    Payload,
    error::{Error, ErrorKind, Result},
};

const U32_BYTE_SIZE: usize = std::mem::size_of::<u32>();

/// Read side of a connection. Only one task may read at a time.
#[derive(Debug)]
pub struct CodecReader<R> {
    reader: R,
    codec: CodecType,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(reader: R, codec: CodecType) -> Self {
        Self { reader, codec }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// # Errors
    ///
    /// Returns [`ErrorKind::ConnectionClosed`] if the stream ends before a new
    /// header starts.
    pub async fn read_header(&mut self) -> Result<Header> {
        let bytes = self.read_frame().await?;
        self.codec.decode(&bytes)
    }

    /// Reads the body that follows a header, without decoding it.
    ///
    /// # Errors
    pub async fn read_body(&mut self) -> Result<Payload> {
        Ok(self.read_frame().await?.into())
    }

    async fn read_frame(&mut self) -> Result<Bytes> {
        let len = self.reader.read_u32().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::new(ErrorKind::ConnectionClosed, "socket eof".to_string())
            } else {
                Error::new(ErrorKind::TcpRecvMsgFailed, e.to_string())
            }
        })?;

        let len = usize::try_from(len)?;
        if len >= MAX_MSG_SIZE {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                format!("msg is too long: {len}"),
            ));
        }

        let mut bytes = BytesMut::zeroed(len);
        self.reader
            .read_exact(&mut bytes)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpRecvMsgFailed, e.to_string()))?;
        Ok(bytes.freeze())
    }
}

/// Write side of a connection.
///
/// A header and its body leave in a single `write_all`, so callers only need
/// to serialize whole calls to [`CodecWriter::write`].
#[derive(Debug)]
pub struct CodecWriter<W> {
    writer: W,
    codec: CodecType,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(writer: W, codec: CodecType) -> Self {
        Self {
            writer,
            codec,
            closed: false,
        }
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    /// # Errors
    pub async fn write(&mut self, header: &Header, body: Option<&[u8]>) -> Result<()> {
        if self.closed {
            return Err(Error::new(
                ErrorKind::ConnectionClosed,
                "write on closed connection".to_string(),
            ));
        }

        let header = self.codec.encode(header)?;
        let body_len = body.map_or(0, |b| U32_BYTE_SIZE + b.len());
        let mut bytes = BytesMut::with_capacity(U32_BYTE_SIZE + header.len() + body_len);
        Self::put_frame(&mut bytes, &header)?;
        if let Some(body) = body {
            Self::put_frame(&mut bytes, body)?;
        }

        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::new(ErrorKind::TcpSendMsgFailed, e.to_string()))
    }

    /// Shuts the write half down. Calling it again does nothing.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.writer.shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn put_frame(bytes: &mut BytesMut, frame: &[u8]) -> Result<()> {
        if frame.len() >= MAX_MSG_SIZE {
            return Err(Error::new(
                ErrorKind::SerializeFailed,
                format!("msg is too long: {}", frame.len()),
            ));
        }
        bytes.put_u32(u32::try_from(frame.len())?);
        bytes.extend_from_slice(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_across_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = CodecWriter::new(client, CodecType::MessagePack);
        let mut reader = CodecReader::new(server, CodecType::MessagePack);

        let body = CodecType::MessagePack.encode(&21i64).unwrap();
        let header = Header::request("Foo.Double", 7);
        writer.write(&header, Some(&body[..])).await.unwrap();

        let mut failed = Header::request("Foo.Double", 8);
        failed.error = "HandlerError: boom".into();
        writer.write(&failed, None).await.unwrap();

        assert_eq!(reader.read_header().await.unwrap(), header);
        let payload = reader.read_body().await.unwrap();
        assert_eq!(CodecType::MessagePack.decode::<i64>(&payload).unwrap(), 21);

        let got = reader.read_header().await.unwrap();
        assert!(got.is_error());
        assert_eq!(got.seq, 8);

        writer.close().await;
        writer.close().await;
        assert!(writer.is_closed());
        let err = reader.read_header().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionClosed);

        let err = writer.write(&header, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = CodecReader::new(server, CodecType::Json);
        client
            .write_all(&u32::MAX.to_be_bytes())
            .await
            .unwrap();
        let err = reader.read_header().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError);
    }
}
