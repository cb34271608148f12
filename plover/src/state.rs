use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::{fmt::Display, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};

use crate::{
    Context, Router, ServerConfig, TaskSupervisor,
    codec::{CodecReader, CodecWriter, Handshake, Header},
    error::{Error, ErrorKind, Result},
};

type SharedWriter<W> = Arc<Mutex<CodecWriter<W>>>;

/// Everything a server connection needs: the method directory, the server
/// configuration and the supervisor owning all connection tasks.
pub struct State {
    pub router: Router,
    pub(crate) config: ServerConfig,
    pub(crate) task_supervisor: TaskSupervisor,
}

impl State {
    #[must_use]
    pub fn create(router: Router, config: &ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            router,
            config: config.clone(),
            task_supervisor: TaskSupervisor::create(),
        })
    }

    /// Serves one accepted connection until the peer leaves or the
    /// connection breaks.
    ///
    /// Requests are read one after another. Each handler runs in its own
    /// task; the next request is read once the handler has finished or
    /// `handle_timeout` has passed, whichever comes first. Responses may
    /// therefore leave in a different order than requests arrived.
    pub async fn serve_conn<S>(self: Arc<Self>, mut stream: S, peer: impl Display)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handshake = match Handshake::read_from(&mut stream).await {
            Ok(handshake) => handshake,
            Err(e) => {
                tracing::warn!("reject connection from {peer}: {e}");
                return;
            }
        };
        tracing::debug!("accept connection from {peer} using {}", handshake.codec);

        let (recv_stream, send_stream) = tokio::io::split(stream);
        let mut reader = CodecReader::new(recv_stream, handshake.codec);
        let writer = Arc::new(Mutex::new(CodecWriter::new(send_stream, handshake.codec)));

        match self.start_serve_loop(&mut reader, &writer).await {
            Err(e) if e.kind == ErrorKind::ConnectionClosed => {
                tracing::debug!("connection from {peer} closed");
            }
            Err(e) => tracing::error!("serve connection from {peer} failed: {e}"),
            Ok(()) => {}
        }
        writer.lock().await.close().await;
    }

    async fn start_serve_loop<R, W>(
        &self,
        reader: &mut CodecReader<R>,
        writer: &SharedWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let codec = reader.codec();
        loop {
            let header = reader.read_header().await?;
            let method = match self.router.resolve(&header.service_method) {
                Ok(method) => method,
                Err(err) => {
                    // the body was never read, so the stream can't be resynced.
                    tracing::warn!("{err}");
                    return Self::send_error(writer, header, &err).await;
                }
            };
            let body = reader.read_body().await?;

            let ctx = Context::background().with_timeout(self.config.handle_timeout);
            let fut = method(ctx, codec, body);
            let seq = header.seq;
            let service_method = header.service_method.clone();
            let mut task = tokio::spawn(Self::handle_request(fut, header, writer.clone()));

            tokio::select! {
                r = &mut task => match r {
                    Ok(r) => r?,
                    Err(e) => {
                        tracing::error!("handler for {service_method}#{seq} panicked: {e}");
                        let header = Header::request(&service_method, seq);
                        let err = Error::new(ErrorKind::HandlerError, "handler panicked".into());
                        Self::send_error(writer, header, &err).await?;
                    }
                },
                () = tokio::time::sleep(self.config.handle_timeout) => {
                    tracing::warn!(
                        "handle {service_method}#{seq} timeout: expect within {:?}",
                        self.config.handle_timeout
                    );
                }
            }
        }
    }

    async fn handle_request<W: AsyncWrite + Unpin>(
        fut: BoxFuture<'static, Result<Bytes>>,
        mut header: Header,
        writer: SharedWriter<W>,
    ) -> Result<()> {
        let result = fut.await;
        let mut writer = writer.lock().await;
        let sent = match result {
            Ok(reply) => writer.write(&header, Some(&reply[..])).await,
            Err(err) => {
                tracing::debug!("{}#{} failed: {err}", header.service_method, header.seq);
                header.error = err.to_string();
                writer.write(&header, None).await
            }
        };
        sent.inspect_err(|e| {
            tracing::error!(
                "send response for {}#{} failed: {e}",
                header.service_method,
                header.seq
            );
        })
    }

    async fn send_error<W: AsyncWrite + Unpin>(
        writer: &SharedWriter<W>,
        mut header: Header,
        err: &Error,
    ) -> Result<()> {
        header.error = err.to_string();
        writer.lock().await.write(&header, None).await
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("router", &self.router)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
