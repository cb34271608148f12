use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use std::{fmt::Display, net::SocketAddr, sync::Arc, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::DropGuard;

use crate::{Listener, Result, Router, State, registry};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ServerConfig {
    /// How long a connection waits for one handler before reading the next
    /// request. Also the deadline of the handler's context.
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub handle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// RPC server that accepts connections and dispatches requests to the
/// services registered in its [`Router`].
///
/// # Examples
///
/// ```rust,no_run
/// # use plover::{Context, Router, Server, ServerConfig};
/// # use std::sync::Arc;
/// #[plover::service]
/// trait Echo {
///     async fn echo(&self, ctx: &Context, req: &String) -> plover::Result<String>;
/// }
///
/// struct EchoImpl;
///
/// impl Echo for EchoImpl {
///     async fn echo(&self, _ctx: &Context, req: &String) -> plover::Result<String> {
///         Ok(req.clone())
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() {
/// let mut router = Router::default();
/// Arc::new(EchoImpl).plover_export(&mut router).unwrap();
///
/// let server = Server::create(router, &ServerConfig::default());
/// let addr = server.listen("127.0.0.1:8000".parse().unwrap()).await.unwrap();
/// println!("listening on {addr}");
/// server.join().await;
/// # }
/// ```
pub struct Server {
    state: Arc<State>,
    listener: Listener,
    _drop_guard: DropGuard,
}

impl Server {
    #[must_use]
    pub fn create(router: Router, config: &ServerConfig) -> Self {
        let state = State::create(router, config);
        let drop_guard = state.task_supervisor.drop_guard();
        Self {
            state,
            listener: Listener::default(),
            _drop_guard: drop_guard,
        }
    }

    #[must_use]
    pub fn router(&self) -> &Router {
        &self.state.router
    }

    /// Starts accepting connections on `addr`. Returns the bound address,
    /// which differs from `addr` when port 0 was requested.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ErrorKind::TcpBindFailed`] if the address can't be bound.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.listener.start_listen(addr, &self.state).await
    }

    /// Serves a single already established stream until it ends.
    pub async fn serve_conn<S>(&self, stream: S, peer: impl Display + Send + 'static)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.state.clone().serve_conn(stream, peer).await;
    }

    /// Announces `addr` to the registry at `registry` once.
    ///
    /// # Errors
    pub async fn register_to(&self, registry: &str, addr: &str) -> Result<()> {
        registry::post_server(registry, addr).await?;
        tracing::info!("registered {addr} to {registry}");
        Ok(())
    }

    /// Announces `addr` to the registry now and then every `interval`
    /// until the server stops. Failures are logged and retried on the next tick.
    pub fn start_heartbeat(&self, registry: &str, addr: &str, interval: Duration) {
        let registry = registry.to_string();
        let addr = addr.to_string();
        self.listener.spawn(async move {
            loop {
                if let Err(e) = registry::post_server(&registry, &addr).await {
                    tracing::warn!("heartbeat to {registry} failed: {e}");
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Stops accepting and closes every open connection.
    pub fn stop(&self) {
        self.listener.stop();
        self.state.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.listener.join().await;
        self.state.task_supervisor.all_stopped().await;
    }
}
