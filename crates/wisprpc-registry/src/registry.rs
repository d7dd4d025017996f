//! The registry HTTP service.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, info};

use wisprpc_common::protocol::{
    DEFAULT_REGISTRY_PATH, REGISTRY_SERVERS_HEADER, REGISTRY_SERVER_HEADER,
};
use wisprpc_common::{Result, RpcError};

/// Default endpoint TTL (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Endpoint registry keyed by address. An entry is alive while its last
/// heartbeat is younger than the TTL; a TTL of zero never expires anything.
/// Expired entries are swept during queries, so no background task runs.
pub struct Registry {
    ttl: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    pub fn new(ttl: Duration) -> Self {
        Registry {
            ttl,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Records or refreshes one endpoint's heartbeat.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.servers.lock().unwrap();
        servers.insert(addr.to_string(), Instant::now());
    }

    /// Returns the alive endpoints, lexicographically sorted, deleting
    /// expired entries along the way.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        if !self.ttl.is_zero() {
            servers.retain(|_, last| last.elapsed() < self.ttl);
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    /// The axum router serving the registry protocol at `path`:
    /// `GET` answers with the alive set in the `X-Geerpc-Servers` header,
    /// `POST` upserts the address from `X-Geerpc-Server` (500 when the
    /// header is missing), and any other method gets a 405.
    pub fn router(self: Arc<Self>, path: &str) -> Router {
        Router::new()
            .route(path, get(get_servers).post(post_heartbeat))
            .with_state(self)
    }

    /// Serves the registry at [`DEFAULT_REGISTRY_PATH`] until the listener
    /// fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, path = DEFAULT_REGISTRY_PATH, "registry listening");
        }
        let app = self.router(DEFAULT_REGISTRY_PATH);
        axum::serve(listener, app)
            .await
            .map_err(|e| RpcError::Registry(format!("registry server error: {}", e)))
    }
}

async fn get_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let alive = registry.alive_servers().join(",");
    ([(REGISTRY_SERVERS_HEADER, alive)], StatusCode::OK)
}

async fn post_heartbeat(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    match headers
        .get(REGISTRY_SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|addr| !addr.is_empty())
    {
        Some(addr) => {
            debug!(addr, "heartbeat received");
            registry.put_server(addr);
            StatusCode::OK
        }
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
