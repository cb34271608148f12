use foldhash::fast::RandomState;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;

use crate::{
    Client, ClientConfig, Context, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    hash_ring::HashRing,
    registry,
};

/// How an [`XClient`] picks the server for each call.
#[derive(
    Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, Hash, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SelectMode {
    /// Uniformly at random.
    #[default]
    Random,
    /// Cycles through known servers in the order they were added.
    RoundRobin,
    /// Hashes the request and method name onto a consistent hash ring.
    ConsistentHash,
}

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct XClientConfig {
    #[serde_inline_default(SelectMode::Random)]
    pub mode: SelectMode,
    /// Points per server on the hash ring.
    #[serde_inline_default(10)]
    pub replicas: usize,
    #[serde_inline_default(Duration::from_secs(60))]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Registry url polled for servers, e.g. `http://127.0.0.1:9999/_plover_/registry`.
    #[serde_inline_default(None)]
    pub registry: Option<String>,
    #[serde(default)]
    pub client: ClientConfig,
}

impl Default for XClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

struct Servers {
    addrs: Vec<String>,
    clients: HashMap<String, Arc<Client>, RandomState>,
    index: usize,
    rng: StdRng,
    ring: HashRing,
    closed: bool,
}

impl Servers {
    fn select(&mut self, mode: SelectMode, key: &[u8]) -> Option<String> {
        if self.addrs.is_empty() {
            return None;
        }
        match mode {
            SelectMode::Random => {
                let idx = self.rng.random_range(0..self.addrs.len());
                Some(self.addrs[idx].clone())
            }
            SelectMode::RoundRobin => {
                let idx = self.index % self.addrs.len();
                self.index = self.index.wrapping_add(1);
                Some(self.addrs[idx].clone())
            }
            SelectMode::ConsistentHash => self.ring.get(key).map(String::from),
        }
    }

    /// Returns the client for `addr` if it is still usable. A broken one is dropped.
    fn ready_client(&mut self, addr: &str) -> Option<Arc<Client>> {
        let client = self.clients.get(addr)?;
        if client.is_available() {
            return Some(client.clone());
        }
        tracing::info!("drop unavailable client for {addr}");
        client.close();
        self.clients.remove(addr);
        None
    }

    fn add(&mut self, addr: &str) {
        if !self.addrs.iter().any(|a| a == addr) {
            tracing::info!("discover new server {addr}");
            self.addrs.push(addr.to_string());
            self.ring.add(addr);
        }
    }
}

struct Shared {
    config: XClientConfig,
    servers: Mutex<Servers>,
}

impl Shared {
    /// Returns a usable client for `addr`, dialing a new one when needed.
    /// The server set is not locked while dialing.
    async fn client(&self, addr: &str) -> Result<Arc<Client>> {
        {
            let mut servers = self.servers.lock().await;
            if servers.closed {
                return Err(closed());
            }
            if let Some(client) = servers.ready_client(addr) {
                return Ok(client);
            }
        }

        let client = Arc::new(Client::dial(addr, &self.config.client).await?);

        let mut servers = self.servers.lock().await;
        if servers.closed {
            client.close();
            return Err(closed());
        }
        // another task may have dialed the same server meanwhile.
        if let Some(existing) = servers.ready_client(addr) {
            client.close();
            return Ok(existing);
        }
        servers.clients.insert(addr.to_string(), client.clone());
        Ok(client)
    }

    async fn dial(&self, addr: &str) -> Result<()> {
        self.client(addr).await?;
        self.servers.lock().await.add(addr);
        Ok(())
    }

    async fn dial_servers(&self, addrs: &[String]) -> usize {
        let mut dialed = 0;
        for addr in addrs {
            match self.dial(addr).await {
                Ok(()) => dialed += 1,
                Err(e) => {
                    if self.servers.lock().await.closed {
                        break;
                    }
                    tracing::warn!("dial {addr} failed: {e}");
                }
            }
        }
        dialed
    }

    async fn start_discovery_loop(self: Arc<Self>, registry: String) {
        loop {
            match registry::fetch_servers(&registry).await {
                Ok(addrs) => {
                    let dialed = self.dial_servers(&addrs).await;
                    tracing::debug!("discovery: {dialed} of {} servers reachable", addrs.len());
                }
                Err(e) => tracing::warn!("discovery from {registry} failed: {e}"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

/// Client over a set of servers.
///
/// Every call picks one server according to the [`SelectMode`] and is sent
/// through that server's [`Client`]. Servers are added explicitly with
/// [`XClient::dial`] or found by polling a registry.
pub struct XClient {
    shared: Arc<Shared>,
    task_supervisor: TaskSupervisor,
}

impl XClient {
    #[must_use]
    pub fn new(config: &XClientConfig) -> Self {
        let shared = Arc::new(Shared {
            config: config.clone(),
            servers: Mutex::new(Servers {
                addrs: Vec::new(),
                clients: HashMap::default(),
                index: 0,
                rng: StdRng::from_os_rng(),
                ring: HashRing::new(config.replicas),
                closed: false,
            }),
        });

        let task_supervisor = TaskSupervisor::create();
        if let Some(registry) = &config.registry {
            task_supervisor.spawn(shared.clone().start_discovery_loop(registry.clone()));
        }

        Self {
            shared,
            task_supervisor,
        }
    }

    /// Connects to `addr` and adds it to the server set.
    ///
    /// # Errors
    pub async fn dial(&self, addr: &str) -> Result<()> {
        self.shared.dial(addr).await
    }

    /// Dials every address, skipping the unreachable ones. Returns how many
    /// are connected.
    pub async fn dial_servers(&self, addrs: &[String]) -> usize {
        self.shared.dial_servers(addrs).await
    }

    /// Calls `service_method` on one of the known servers.
    ///
    /// In [`SelectMode::ConsistentHash`] the server is picked by the request
    /// as encoded with the client codec, plus the method name.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoServerAvailable`] when no server is known, and
    /// otherwise whatever [`Client::call`] returns.
    pub async fn call<Req, Rsp>(&self, ctx: &Context, service_method: &str, req: &Req) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        let mode = self.shared.config.mode;
        let key = if mode == SelectMode::ConsistentHash {
            let mut key = self.shared.config.client.codec.encode(req)?.to_vec();
            key.push(b'+');
            key.extend_from_slice(service_method.as_bytes());
            key
        } else {
            Vec::new()
        };

        let addr = {
            let mut servers = self.shared.servers.lock().await;
            if servers.closed {
                return Err(closed());
            }
            servers.select(mode, &key).ok_or_else(|| {
                Error::new(ErrorKind::NoServerAvailable, format!("no server for {service_method}"))
            })?
        };
        let client = ctx.run(self.shared.client(&addr)).await??;
        client.call(ctx, service_method, req).await
    }

    /// Known server addresses in the order they were added.
    pub async fn addrs(&self) -> Vec<String> {
        self.shared.servers.lock().await.addrs.clone()
    }

    /// Closes every connection and stops discovery.
    pub async fn close(&self) {
        self.task_supervisor.stop();
        let mut servers = self.shared.servers.lock().await;
        servers.closed = true;
        for (_, client) in servers.clients.drain() {
            client.close();
        }
    }
}

fn closed() -> Error {
    Error::new(ErrorKind::ConnectionClosed, "xclient is closed".into())
}

impl std::fmt::Debug for XClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XClient")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
