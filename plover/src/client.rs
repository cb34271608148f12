use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::Mutex,
};

use crate::{
    Context, TaskSupervisor, Waiter,
    codec::{CodecReader, CodecType, CodecWriter, Handshake, Header, MAX_MSG_SIZE},
    error::{Error, ErrorKind, Result},
    waiter::Delivery,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    #[serde_inline_default(CodecType::MessagePack)]
    pub codec: CodecType,
    /// Applied to every call on top of the caller's context.
    #[serde_inline_default(None)]
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

struct Shared {
    waiter: Waiter,
    writer: Mutex<CodecWriter<BoxedWriter>>,
    available: AtomicBool,
}

impl Shared {
    fn mark_unavailable(&self) {
        self.available.store(false, Ordering::Release);
    }

    async fn shutdown(&self, err: Error) {
        self.mark_unavailable();
        self.waiter.terminate(err);
        self.writer.lock().await.close().await;
    }
}

/// One connection to one server.
///
/// Calls may be issued concurrently from many tasks; responses are matched
/// to callers by `seq` by a single background reader. Once the connection
/// fails the client stays unavailable and must be replaced by a fresh dial.
pub struct Client {
    addr: String,
    config: ClientConfig,
    shared: Arc<Shared>,
    task_supervisor: TaskSupervisor,
}

impl Client {
    /// Connects to `addr` and performs the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::TcpConnectFailed`] if the server cannot be reached
    /// and [`ErrorKind::ProtocolError`] if the handshake cannot be written.
    pub async fn dial(addr: &str, config: &ClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::new(ErrorKind::TcpConnectFailed, format!("connect {addr}: timeout")))?
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, format!("connect {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        Self::from_stream(addr, stream, config).await
    }

    /// Runs the client over an already established stream.
    ///
    /// # Errors
    pub async fn from_stream<S>(addr: &str, mut stream: S, config: &ClientConfig) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = config.codec;
        Handshake::new(codec).write_to(&mut stream).await?;

        let (recv_stream, send_stream) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            waiter: Waiter::default(),
            writer: Mutex::new(CodecWriter::new(Box::new(send_stream) as BoxedWriter, codec)),
            available: AtomicBool::new(true),
        });

        let task_supervisor = TaskSupervisor::create();
        let guard = task_supervisor.start_async_task();
        // the supervisor counts as stopped once the reader is gone for any reason.
        let stop_on_exit = task_supervisor.drop_guard();
        tokio::spawn({
            let shared = shared.clone();
            let addr = addr.to_string();
            let reader = CodecReader::new(recv_stream, codec);
            async move {
                let err = tokio::select! {
                    () = guard.stopped() => {
                        Error::new(ErrorKind::ConnectionClosed, "client closed".to_string())
                    }
                    r = Self::start_recv_loop(reader, &shared) => match r {
                        Ok(()) => Error::kind(ErrorKind::ConnectionClosed),
                        Err(e) => e,
                    }
                };
                if err.kind == ErrorKind::ConnectionClosed {
                    tracing::debug!("connection to {addr} closed: {err}");
                } else {
                    tracing::error!("recv loop for {addr} failed: {err}");
                }
                shared
                    .shutdown(Error::new(ErrorKind::ConnectionClosed, err.to_string()))
                    .await;
                drop(stop_on_exit);
            }
        });

        Ok(Self {
            addr: addr.to_string(),
            config: config.clone(),
            shared,
            task_supervisor,
        })
    }

    /// Calls `service_method` with `req` and waits for the reply.
    ///
    /// The call ends early when `ctx` (or the configured default timeout)
    /// expires or is cancelled, including while it waits for its turn to
    /// write. It is then forgotten locally and a response arriving later is
    /// discarded. The server is not notified. A request interrupted halfway
    /// onto the wire closes the connection.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::DeadlineExceeded`] / [`ErrorKind::Cancelled`] from the context.
    /// - A transport error if the connection is or becomes unusable.
    /// - The error reported by the remote handler.
    pub async fn call<Req, Rsp>(&self, ctx: &Context, service_method: &str, req: &Req) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        ctx.check()?;
        if !self.is_available() {
            return Err(self.unavailable());
        }

        let codec = self.config.codec;
        let body = codec.encode(req)?;
        if body.len() >= MAX_MSG_SIZE {
            return Err(Error::new(
                ErrorKind::SerializeFailed,
                format!("msg is too long: {}", body.len()),
            ));
        }

        let ctx = match self.config.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };

        // seq allocation and the write share one critical section so seqs hit the wire in order.
        let mut writing = false;
        let sent = ctx
            .run(async {
                let mut writer = self.shared.writer.lock().await;
                if !self.is_available() {
                    return Err(self.unavailable());
                }
                let (seq, receiver) = self.shared.waiter.alloc()?;
                let header = Header::request(service_method, seq);
                writing = true;
                writer.write(&header, Some(&body[..])).await?;
                Ok::<_, Error>((seq, receiver))
            })
            .await;

        let (seq, receiver) = match sent {
            Ok(Ok(sent)) => sent,
            Ok(Err(e)) => {
                if e.kind.is_transport() {
                    tracing::error!("send {service_method} to {} failed: {e}", self.addr);
                    self.shared.mark_unavailable();
                }
                return Err(e);
            }
            Err(e) => {
                // a frame cut off halfway leaves the stream unparsable.
                if writing {
                    tracing::warn!("send {service_method} to {} interrupted: {e}", self.addr);
                    self.close();
                }
                return Err(e);
            }
        };

        let payload = ctx
            .run(receiver.recv())
            .await
            .inspect_err(|e| tracing::debug!("call {service_method}#{seq} to {} ended: {e}", self.addr))??;
        codec.decode(&payload)
    }

    /// Stops the reader and shuts the connection down. Pending calls fail
    /// with [`ErrorKind::ConnectionClosed`].
    pub fn close(&self) {
        self.shared.mark_unavailable();
        self.task_supervisor.stop();
    }

    fn unavailable(&self) -> Error {
        Error::new(
            ErrorKind::ConnectionClosed,
            format!("client for {} is unavailable", self.addr),
        )
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[must_use]
    pub fn codec(&self) -> CodecType {
        self.config.codec
    }

    /// Number of calls currently waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.waiter.len()
    }

    /// Waits until the background reader has exited.
    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }

    async fn start_recv_loop<R: AsyncRead + Unpin>(
        mut reader: CodecReader<R>,
        shared: &Shared,
    ) -> Result<()> {
        loop {
            let header = reader.read_header().await?;
            let result = if header.is_error() {
                Err(Error::from_remote(&header.error))
            } else {
                Ok(reader.read_body().await?)
            };

            match shared.waiter.post(header.seq, result) {
                Delivery::Delivered => {}
                Delivery::Late => {
                    tracing::warn!(
                        "drop late response for {}#{}",
                        header.service_method,
                        header.seq
                    );
                }
                Delivery::Unknown => {
                    return Err(Error::new(
                        ErrorKind::ProtocolError,
                        format!("receive unknown seq: {}", header.seq),
                    ));
                }
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("codec", &self.config.codec)
            .field("available", &self.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.codec, CodecType::MessagePack);
        assert_eq!(config.timeout, None);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));

        let config: ClientConfig =
            serde_json::from_str(r#"{"codec": "json", "timeout": "250ms"}"#).unwrap();
        assert_eq!(config.codec, CodecType::Json);
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
    }

    /// Plays the server side of a connection by hand.
    struct FakeServer {
        reader: CodecReader<tokio::io::ReadHalf<DuplexStream>>,
        writer: CodecWriter<tokio::io::WriteHalf<DuplexStream>>,
    }

    impl FakeServer {
        async fn accept(mut stream: DuplexStream) -> Self {
            let handshake = Handshake::read_from(&mut stream).await.unwrap();
            let (r, w) = tokio::io::split(stream);
            Self {
                reader: CodecReader::new(r, handshake.codec),
                writer: CodecWriter::new(w, handshake.codec),
            }
        }

        async fn recv(&mut self) -> (Header, i64) {
            let header = self.reader.read_header().await.unwrap();
            let body = self.reader.read_body().await.unwrap();
            let arg = self.reader.codec().decode(&body).unwrap();
            (header, arg)
        }

        async fn reply(&mut self, header: &Header, value: i64) {
            let body = self.writer.codec().encode(&value).unwrap();
            self.writer.write(header, Some(&body[..])).await.unwrap();
        }
    }

    async fn pair() -> (Arc<Client>, FakeServer) {
        let (client_stream, server_stream) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(FakeServer::accept(server_stream));
        let client = Client::from_stream("duplex", client_stream, &ClientConfig::default())
            .await
            .unwrap();
        (Arc::new(client), server.await.unwrap())
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let (client, mut server) = pair().await;

        let calls: Vec<_> = (0..8i64)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    let rsp: i64 = client
                        .call(&Context::background(), "Foo.Double", &i)
                        .await
                        .unwrap();
                    (i, rsp)
                })
            })
            .collect();

        let mut requests = vec![];
        for _ in 0..8 {
            requests.push(server.recv().await);
        }
        let mut seqs: Vec<_> = requests.iter().map(|(h, _)| h.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..8).collect::<Vec<_>>());

        // answer in reverse order.
        for (header, arg) in requests.iter().rev() {
            server.reply(header, arg * 2).await;
        }

        for call in calls {
            let (i, rsp) = call.await.unwrap();
            assert_eq!(rsp, i * 2);
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_call_discards_late_response() {
        let (client, mut server) = pair().await;

        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let err = client
            .call::<_, i64>(&ctx, "Foo.Double", &1i64)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        assert_eq!(client.pending_calls(), 0);

        let (late, _) = server.recv().await;
        server.reply(&late, 999).await;

        // the connection survives the late response and serves the next call.
        let next = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, i64>(&Context::background(), "Foo.Double", &2i64)
                    .await
            })
        };
        let (header, arg) = server.recv().await;
        assert_eq!(header.seq, late.seq + 1);
        server.reply(&header, arg * 2).await;
        assert_eq!(next.await.unwrap().unwrap(), 4);
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_cancel_signal() {
        let (client, mut server) = pair().await;

        let ctx = Context::background().with_cancel();
        let call = {
            let client = client.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { client.call::<_, i64>(&ctx, "Foo.Double", &1i64).await })
        };
        let _ = server.recv().await;
        ctx.cancel();
        assert_eq!(call.await.unwrap().unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_has_no_body() {
        let (client, mut server) = pair().await;

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, i64>(&Context::background(), "Foo.Double", &1i64)
                    .await
            })
        };
        let (mut header, _) = server.recv().await;
        header.error = Error::new(ErrorKind::InvalidArgument, "negative".into()).to_string();
        server.writer.write(&header, None).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, Error::new(ErrorKind::InvalidArgument, "negative".into()));
        assert!(client.is_available());
    }

    #[tokio::test]
    async fn test_unknown_seq_breaks_connection() {
        let (client, mut server) = pair().await;

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, i64>(&Context::background(), "Foo.Double", &1i64)
                    .await
            })
        };
        let (mut header, _) = server.recv().await;
        header.seq = 1000;
        server.reply(&header, 0).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(err.kind.is_transport(), "{err}");
        client.join().await;
        assert!(!client.is_available());

        let err = client
            .call::<_, i64>(&Context::background(), "Foo.Double", &1i64)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (client, mut server) = pair().await;

        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, i64>(&Context::background(), "Foo.Double", &1i64)
                    .await
            })
        };
        let _ = server.recv().await;
        client.close();
        client.close();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionClosed);
        assert!(!client.is_available());

        // the server sees the connection end.
        let err = server.reader.read_header().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_oversized_request_keeps_connection() {
        let (client, mut server) = pair().await;

        let err = client
            .call::<_, i64>(&Context::background(), "Foo.Echo", &"x".repeat(MAX_MSG_SIZE))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SerializeFailed);
        assert!(client.is_available());
        assert_eq!(client.pending_calls(), 0);

        let next = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, i64>(&Context::background(), "Foo.Double", &2i64)
                    .await
            })
        };
        let (header, arg) = server.recv().await;
        assert_eq!(header.seq, 0);
        server.reply(&header, arg * 2).await;
        assert_eq!(next.await.unwrap().unwrap(), 4);
    }

    /// A client whose peer never drains a small pipe, so large writes stall.
    async fn stalled_pair() -> (Arc<Client>, DuplexStream) {
        let (client_stream, server_stream) = tokio::io::duplex(1024);
        let client = Client::from_stream("duplex", client_stream, &ClientConfig::default())
            .await
            .unwrap();
        (Arc::new(client), server_stream)
    }

    #[tokio::test]
    async fn test_deadline_covers_waiting_to_send() {
        let (client, _server_stream) = stalled_pair().await;

        let blocked = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call::<_, i64>(&Context::background(), "Foo.Echo", &vec![7u8; 1 << 20])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let start = std::time::Instant::now();
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let err = client
            .call::<_, i64>(&ctx, "Foo.Double", &1i64)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        assert!(start.elapsed() < Duration::from_millis(500), "{:?}", start.elapsed());

        // it never reached the wire, so only the stalled call is pending.
        assert!(client.is_available());
        assert_eq!(client.pending_calls(), 1);
        blocked.abort();
    }

    #[tokio::test]
    async fn test_interrupted_send_closes_connection() {
        let (client, _server_stream) = stalled_pair().await;

        let start = std::time::Instant::now();
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let err = client
            .call::<_, i64>(&ctx, "Foo.Echo", &vec![7u8; 1 << 20])
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        assert!(start.elapsed() < Duration::from_millis(500), "{:?}", start.elapsed());

        assert!(!client.is_available());
        client.join().await;
        assert_eq!(client.pending_calls(), 0);
    }
}
