//! Endpoint discovery: a load-balanced view over a list of servers, either
//! supplied statically or polled from the heartbeat registry.

use futures::future::BoxFuture;
use rand::Rng;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use wisprpc_common::protocol::REGISTRY_SERVERS_HEADER;
use wisprpc_common::{Result, RpcError};

/// Default refresh window of the registry-backed discovery.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(10);

/// Load-balancing strategy used by [`Discovery::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Uniform choice over the current list.
    Random,
    /// Modular successor of the previous pick.
    RoundRobin,
}

/// A source of RPC endpoints.
pub trait Discovery: Send + Sync {
    /// Re-reads the backing source if the local view is stale.
    fn refresh(&self) -> BoxFuture<'_, Result<()>>;

    /// Replaces the endpoint list by hand.
    fn update(&self, servers: Vec<String>) -> BoxFuture<'_, ()>;

    /// Picks one endpoint according to `mode`, refreshing first.
    fn get(&self, mode: SelectMode) -> BoxFuture<'_, Result<String>>;

    /// Returns a copy of all endpoints, refreshing first.
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}

struct ServerList {
    servers: Vec<String>,
    /// Round-robin cursor. Starts at a random offset so independent clients
    /// do not all hammer the first endpoint.
    index: usize,
}

/// Discovery over a fixed, caller-maintained endpoint list.
pub struct MultiServerDiscovery {
    inner: StdMutex<ServerList>,
}

impl MultiServerDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let index = if servers.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..servers.len())
        };
        MultiServerDiscovery {
            inner: StdMutex::new(ServerList { servers, index }),
        }
    }

    fn pick(&self, mode: SelectMode) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.servers.len();
        if n == 0 {
            return Err(RpcError::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let i = rand::thread_rng().gen_range(0..n);
                Ok(inner.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                let i = inner.index % n;
                inner.index = (i + 1) % n;
                Ok(inner.servers[i].clone())
            }
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.inner.lock().unwrap().servers.clone()
    }

    fn replace(&self, servers: Vec<String>) {
        self.inner.lock().unwrap().servers = servers;
    }
}

impl Discovery for MultiServerDiscovery {
    fn refresh(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn update(&self, servers: Vec<String>) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.replace(servers) })
    }

    fn get(&self, mode: SelectMode) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { self.pick(mode) })
    }

    fn get_all(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move { Ok(self.snapshot()) })
    }
}

/// Discovery backed by the heartbeat registry.
///
/// The endpoint list is cached locally; [`refresh`](Discovery::refresh) is a
/// no-op inside the refresh window, otherwise it issues one GET and replaces
/// the cache. The window lock is held across the GET, so concurrent lookups
/// in one window still cost a single registry round trip.
pub struct RegistryDiscovery {
    servers: MultiServerDiscovery,
    registry: String,
    refresh_ttl: Duration,
    http: reqwest::Client,
    last_refresh: Mutex<Option<Instant>>,
}

impl RegistryDiscovery {
    /// `registry` is the registry endpoint URL; a zero `refresh_ttl` defers
    /// to [`DEFAULT_REFRESH_TTL`].
    pub fn new(registry: impl Into<String>, refresh_ttl: Duration) -> Self {
        let refresh_ttl = if refresh_ttl.is_zero() {
            DEFAULT_REFRESH_TTL
        } else {
            refresh_ttl
        };
        RegistryDiscovery {
            servers: MultiServerDiscovery::new(Vec::new()),
            registry: registry.into(),
            refresh_ttl,
            http: reqwest::Client::new(),
            last_refresh: Mutex::new(None),
        }
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        let mut last_refresh = self.last_refresh.lock().await;
        if let Some(at) = *last_refresh {
            if at.elapsed() < self.refresh_ttl {
                return Ok(());
            }
        }
        debug!(registry = %self.registry, "refreshing servers from registry");
        let response = self
            .http
            .get(&self.registry)
            .send()
            .await
            .map_err(|e| RpcError::Registry(format!("refresh failed: {}", e)))?;
        let raw = response
            .headers()
            .get(REGISTRY_SERVERS_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let servers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        self.servers.replace(servers);
        *last_refresh = Some(Instant::now());
        Ok(())
    }
}

impl Discovery for RegistryDiscovery {
    fn refresh(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.refresh_if_stale())
    }

    fn update(&self, servers: Vec<String>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.servers.replace(servers);
            *self.last_refresh.lock().await = Some(Instant::now());
        })
    }

    fn get(&self, mode: SelectMode) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.refresh_if_stale().await?;
            self.servers.pick(mode)
        })
    }

    fn get_all(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            self.refresh_if_stale().await?;
            Ok(self.servers.snapshot())
        })
    }
}
