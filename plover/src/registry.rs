//! Discovery registry: a tiny HTTP/1 service holding the addresses of
//! running servers.
//!
//! Servers announce themselves with `POST <path>` carrying their address in
//! the [`SERVER_HEADER`] header; clients fetch the sorted, comma separated
//! list from the [`SERVERS_HEADER`] header of a `GET <path>` response.

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use foldhash::fast::RandomState;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::{Bytes, Incoming},
    header::{HOST, HeaderValue},
    server::conn::http1::Builder,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::{Error, ErrorKind, Result, TaskSupervisor};

pub const DEFAULT_PATH: &str = "/_plover_/registry";
pub const SERVERS_HEADER: &str = "x-plover-servers";
pub const SERVER_HEADER: &str = "x-plover-server";

pub struct Registry {
    path: String,
    servers: Mutex<HashMap<String, Instant, RandomState>>,
    http: Builder,
    task_supervisor: TaskSupervisor,
}

impl Registry {
    #[must_use]
    pub fn new(path: &str) -> Arc<Self> {
        let mut http = Builder::new();
        http.keep_alive(true);
        Arc::new(Self {
            path: path.to_string(),
            servers: Mutex::default(),
            http,
            task_supervisor: TaskSupervisor::create(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Every address ever announced, sorted.
    #[must_use]
    pub fn alive_servers(&self) -> Vec<String> {
        let servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut addrs: Vec<_> = servers.keys().cloned().collect();
        addrs.sort_unstable();
        addrs
    }

    fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().unwrap_or_else(PoisonError::into_inner);
        if servers.insert(addr.to_string(), Instant::now()).is_none() {
            tracing::info!("registry: new server {addr}");
        }
    }

    pub fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        if req.uri().path() != self.path {
            return status(StatusCode::NOT_FOUND);
        }

        match *req.method() {
            Method::GET => {
                let servers = self.alive_servers().join(",");
                match HeaderValue::from_str(&servers) {
                    Ok(value) => {
                        let mut rsp = status(StatusCode::OK);
                        rsp.headers_mut().insert(SERVERS_HEADER, value);
                        rsp
                    }
                    Err(e) => {
                        tracing::error!("registry: invalid server list {servers:?}: {e}");
                        status(StatusCode::INTERNAL_SERVER_ERROR)
                    }
                }
            }
            Method::POST => match req
                .headers()
                .get(SERVER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
            {
                Some(addr) if !addr.is_empty() => {
                    self.put_server(addr);
                    status(StatusCode::OK)
                }
                _ => status(StatusCode::BAD_REQUEST),
            },
            _ => status(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    /// Starts serving HTTP on `addr` and returns the bound address.
    ///
    /// # Errors
    pub async fn serve(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;

        let this = self.clone();
        self.task_supervisor.spawn(async move {
            tracing::info!("registry listening: http://{listener_addr}{}", this.path);
            while let Ok((stream, peer)) = listener.accept().await {
                this.handle_new_stream(stream, peer);
            }
        });

        Ok(listener_addr)
    }

    fn handle_new_stream(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let this = self.clone();
        let connection = self.http.serve_connection(
            TokioIo::new(stream),
            hyper::service::service_fn(move |req: Request<Incoming>| {
                let rsp = this.handle(&req);
                async move { Ok::<_, Infallible>(rsp) }
            }),
        );

        self.task_supervisor.spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("registry connection from {peer} failed: {e}");
            }
        });
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("path", &self.path)
            .field("servers", &self.alive_servers())
            .finish_non_exhaustive()
    }
}

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::default());
    *rsp.status_mut() = code;
    rsp
}

fn http_error(msg: String) -> Error {
    Error::new(ErrorKind::HttpRequestFailed, msg)
}

async fn send_request(url: &str, method: Method, server: Option<&str>) -> Result<Response<Incoming>> {
    let uri: Uri = url
        .parse()
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, format!("invalid url {url}: {e}")))?;
    let authority = uri
        .authority()
        .ok_or_else(|| Error::new(ErrorKind::InvalidArgument, format!("url {url} has no host")))?
        .to_string();

    let stream = TcpStream::connect(&authority)
        .await
        .map_err(|e| http_error(format!("connect {authority}: {e}")))?;
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<TokioIo<_>, Full<Bytes>>(TokioIo::new(stream))
            .await
            .map_err(|e| http_error(e.to_string()))?;
    tokio::spawn(conn);

    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    let mut builder = Request::builder()
        .method(method.clone())
        .uri(path)
        .header(HOST, &authority);
    if let Some(server) = server {
        builder = builder.header(SERVER_HEADER, server);
    }
    let req = builder
        .body(Full::default())
        .map_err(|e| http_error(e.to_string()))?;

    let rsp = sender
        .send_request(req)
        .await
        .map_err(|e| http_error(format!("{method} {url}: {e}")))?;
    if !rsp.status().is_success() {
        return Err(http_error(format!("{method} {url}: {}", rsp.status())));
    }
    Ok(rsp)
}

/// Fetches the announced server list from the registry at `url`.
///
/// # Errors
///
/// Returns [`ErrorKind::HttpRequestFailed`] if the registry can't be reached
/// or answers with a non-success status.
pub async fn fetch_servers(url: &str) -> Result<Vec<String>> {
    let rsp = send_request(url, Method::GET, None).await?;
    let servers = match rsp.headers().get(SERVERS_HEADER) {
        Some(value) => value
            .to_str()
            .map_err(|e| http_error(format!("invalid {SERVERS_HEADER}: {e}")))?,
        None => "",
    };
    Ok(parse_servers(servers))
}

/// Announces `addr` to the registry at `url`.
///
/// # Errors
pub async fn post_server(url: &str, addr: &str) -> Result<()> {
    send_request(url, Method::POST, Some(addr)).await?;
    Ok(())
}

/// Splits a comma separated server list, skipping blank entries.
#[must_use]
pub fn parse_servers(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
